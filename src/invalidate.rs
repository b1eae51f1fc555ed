//! Invalidation cascades through the dependents graph.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::computed::Computed;

impl Computed {
    /// Invalidate this instance, then its dependents after the method's
    /// `invalidation_delay`.
    ///
    /// Returns whether this call performed the transition. Invalidating an
    /// instance that is already invalidated does nothing.
    pub fn invalidate(&self) -> bool {
        self.invalidate_after(self.options().invalidation_delay)
    }

    /// Invalidate this instance right away and its dependents after `delay`.
    pub fn invalidate_after(&self, delay: Duration) -> bool {
        let Some(dependents) = self.mark_invalidated() else {
            return false;
        };

        if delay.is_zero() {
            cascade(dependents);
        } else {
            schedule(delay, move || cascade(dependents));
        }

        true
    }
}

/// Invalidate everything reachable from `stack`.
///
/// Each node's state transition succeeds at most once, so nodes reachable
/// along several paths are only processed once and stale cycles terminate.
fn cascade(mut stack: Vec<Weak<Computed>>) {
    let mut count = 0usize;
    while let Some(dependent) = stack.pop() {
        let Some(dependent) = dependent.upgrade() else { continue };
        let Some(next) = dependent.mark_invalidated() else { continue };
        count += 1;

        let delay = dependent.options().invalidation_delay;
        if delay.is_zero() {
            stack.extend(next);
        } else {
            schedule(delay, move || cascade(next));
        }
    }

    if count > 0 {
        trace!(count, "cascade");
    }
}

/// Run `task` after `delay` on the current runtime.
///
/// Outside of a runtime there is no timer, so the task runs immediately.
pub(crate) fn schedule<F>(delay: Duration, task: F)
where
    F: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                task();
            });
        }
        Err(_) => {
            debug!(?delay, "no runtime for deferred invalidation, running it now");
            task();
        }
    }
}
