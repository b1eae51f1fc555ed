//! The ambient computation context.
//!
//! While a memoized computation runs, its instance is installed as the
//! task-local *frame*. Memoized calls made from inside the computation, no
//! matter how deeply nested or how often the task suspends, find the frame and
//! record themselves as dependencies of it.
//!
//! Frames travel with the future, not with the thread: work spawned onto other
//! tasks starts without a frame.
//!
//! The same mechanism carries the *call mode*, which changes what memoized
//! calls do inside a scope:
//!
//! ```
//! # async fn refresh(fetch: impl std::future::Future<Output = memograph::Result<u64>>) {
//! // `fetch` is a memoized call. Inside the scope it invalidates its cached
//! // instance instead of computing.
//! let result = memograph::context::invalidating(fetch).await;
//! assert!(matches!(result, Err(memograph::Error::NotComputed)));
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::computed::{Computed, State};

tokio::task_local! {
    static FRAME: Frame;
}

/// What memoized calls do in the current scope.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum CallMode {
    /// Return the cached value or compute it.
    #[default]
    Compute,
    /// Invalidate the cached instance, if any, without computing.
    Invalidate,
    /// Return the cached value if it is consistent, never compute.
    Existing,
}

/// The state of the current scope.
#[derive(Clone, Default)]
pub(crate) struct Frame(Option<Arc<Node>>);

struct Node {
    /// The innermost running computation.
    computed: Option<Arc<Computed>>,
    mode: CallMode,
    capture: Option<Arc<Mutex<Option<Arc<Computed>>>>>,
    parent: Frame,
}

impl Frame {
    /// The frame of the current task.
    pub(crate) fn current() -> Self {
        FRAME.try_with(Clone::clone).unwrap_or_default()
    }

    pub(crate) fn mode(&self) -> CallMode {
        self.0.as_ref().map_or(CallMode::Compute, |node| node.mode)
    }

    fn computing(&self) -> Option<&Arc<Computed>> {
        self.0.as_ref()?.computed.as_ref()
    }

    /// Whether `computed` is running somewhere up this frame's chain.
    pub(crate) fn is_within(&self, computed: &Arc<Computed>) -> bool {
        let mut frame = self;
        while let Some(node) = &frame.0 {
            if node.computed.as_ref().is_some_and(|c| Arc::ptr_eq(c, computed)) {
                return true;
            }
            frame = &node.parent;
        }
        false
    }

    /// Hand `computed` to the enclosing [`capture`] scope if it has not
    /// captured anything yet.
    pub(crate) fn capture(&self, computed: &Arc<Computed>) {
        if let Some(slot) = self.0.as_ref().and_then(|node| node.capture.as_ref()) {
            slot.lock().get_or_insert_with(|| computed.clone());
        }
    }

    fn child(
        &self,
        computed: Option<Arc<Computed>>,
        mode: CallMode,
        capture: Option<Arc<Mutex<Option<Arc<Computed>>>>>,
    ) -> Self {
        Self(Some(Arc::new(Node { computed, mode, capture, parent: self.clone() })))
    }

    /// A child frame that only changes the call mode.
    fn with_mode(&self, mode: CallMode) -> Self {
        let node = self.0.as_ref();
        self.child(
            node.and_then(|n| n.computed.clone()),
            mode,
            node.and_then(|n| n.capture.clone()),
        )
    }
}

/// The computation currently running on this task.
pub fn current() -> Option<Arc<Computed>> {
    Frame::current().computing().cloned()
}

/// The call mode of the current scope.
pub fn mode() -> CallMode {
    Frame::current().mode()
}

/// Run a computation for `computed` as the current frame.
pub(crate) async fn computing<F: Future>(computed: Arc<Computed>, fut: F) -> F::Output {
    let frame = Frame::current().child(Some(computed), CallMode::Compute, None);
    FRAME.scope(frame, fut).await
}

/// Record `used` as a dependency of the current computation.
///
/// Outside of a computation this does nothing.
pub(crate) fn record_use(used: &Arc<Computed>) {
    let frame = Frame::current();
    if let Some(current) = frame.computing()
        && !Arc::ptr_eq(current, used)
        && current.state() == State::Computing
    {
        current.add_dependency(used);
    }
}

/// Run `fut` with memoized calls invalidating their cached instances.
pub async fn invalidating<F: Future>(fut: F) -> F::Output {
    FRAME.scope(Frame::current().with_mode(CallMode::Invalidate), fut).await
}

/// Run `fut` with memoized calls only returning already cached values.
pub async fn existing<F: Future>(fut: F) -> F::Output {
    FRAME.scope(Frame::current().with_mode(CallMode::Existing), fut).await
}

/// Run `fut` without recording dependencies for the current computation.
pub async fn isolated<F: Future>(fut: F) -> F::Output {
    let frame = Frame::current().child(None, CallMode::Compute, None);
    FRAME.scope(frame, fut).await
}

/// Run `fut` and capture the instance behind the first memoized call it
/// makes.
pub async fn capture<F: Future>(fut: F) -> (F::Output, Option<Arc<Computed>>) {
    let slot = Arc::new(Mutex::new(None));
    let current = Frame::current();
    let frame = current.child(
        current.computing().cloned(),
        current.mode(),
        Some(slot.clone()),
    );
    let output = FRAME.scope(frame, fut).await;
    let captured = slot.lock().take();
    (output, captured)
}
