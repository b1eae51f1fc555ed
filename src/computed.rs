use std::any::type_name;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Notify, broadcast};
use tracing::trace;

use crate::comparer::Erased;
use crate::context;
use crate::error::Error;
use crate::invalidate;
use crate::key::CallKey;
use crate::options::ComputedOptions;

/// The settled result of a computation.
pub type Output = Result<Arc<Erased>, Error>;

/// The source of all versions.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Tags a computed instance.
///
/// Versions are drawn from a process-wide counter when an instance is
/// created. A recomputation therefore always has a strictly greater version
/// than the instance it replaces, and no two instances share one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Version(u64);

impl Version {
    fn next() -> Self {
        Self(NEXT_VERSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The lifecycle state of a computed instance.
///
/// States only move forward. An invalidated instance is never reused; the
/// next call computes a fresh one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum State {
    Computing = 0,
    Consistent = 1,
    Invalidated = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Computing,
            1 => Self::Consistent,
            _ => Self::Invalidated,
        }
    }
}

/// Something that happened to a computed instance.
///
/// Published through [`Registry::subscribe`](crate::Registry::subscribe).
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub key: CallKey,
    pub version: Version,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    Settled,
    Invalidated,
}

type Handler = Box<dyn FnOnce(&Computed) + Send>;

/// The cached result of one call, together with its place in the dependency
/// graph.
pub struct Computed {
    key: CallKey,
    version: Version,
    options: ComputedOptions,
    state: AtomicU8,
    /// Set exactly once, when the computation settles.
    output: OnceLock<Output>,
    /// The computation was cancelled before it settled.
    aborted: AtomicBool,
    /// Invalidation was requested while computing.
    invalidate_on_settle: AtomicBool,
    dependencies: Mutex<Dependencies>,
    dependents: Mutex<FxHashMap<Version, Weak<Computed>>>,
    handlers: Mutex<Vec<Handler>>,
    /// Wakes waiters on settlement, cancellation and invalidation.
    notify: Notify,
    events: broadcast::Sender<Event>,
}

/// Instances read during a computation, deduplicated by version.
#[derive(Default)]
struct Dependencies {
    list: Vec<Arc<Computed>>,
    seen: FxHashSet<Version>,
}

impl Computed {
    pub(crate) fn new(key: CallKey, events: broadcast::Sender<Event>) -> Arc<Self> {
        let options = *key.method().options();
        Arc::new(Self {
            key,
            version: Version::next(),
            options,
            state: AtomicU8::new(State::Computing as u8),
            output: OnceLock::new(),
            aborted: AtomicBool::new(false),
            invalidate_on_settle: AtomicBool::new(false),
            dependencies: Mutex::new(Dependencies::default()),
            dependents: Mutex::new(FxHashMap::default()),
            handlers: Mutex::new(Vec::new()),
            notify: Notify::new(),
            events,
        })
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn options(&self) -> &ComputedOptions {
        &self.options
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_consistent(&self) -> bool {
        self.state() == State::Consistent
    }

    /// The settled output, or `None` while computing.
    pub fn output(&self) -> Option<&Output> {
        self.output.get()
    }

    /// The settled output downcast to `T`, or `None` while computing.
    pub fn value<T: Clone + 'static>(&self) -> Option<Result<T, Error>> {
        self.output().map(|output| match output {
            Ok(value) => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(Error::TypeMismatch { expected: type_name::<T>() }),
            Err(err) => Err(err.clone()),
        })
    }

    /// Read the value and record this instance as a dependency of the
    /// computation currently running on this task, if any.
    ///
    /// Waits for the value if it is still being computed.
    pub async fn use_value<T: Clone + 'static>(self: &Arc<Self>) -> Result<T, Error> {
        if !self.settled().await {
            return Err(Error::Cancelled);
        }
        context::record_use(self);
        self.value().unwrap_or(Err(Error::Cancelled))
    }

    /// The instances this one read while computing.
    pub fn dependencies(&self) -> Vec<Arc<Computed>> {
        self.dependencies.lock().list.clone()
    }

    /// The live instances that read this one.
    pub fn dependents(&self) -> Vec<Arc<Computed>> {
        self.dependents.lock().values().filter_map(Weak::upgrade).collect()
    }

    /// Run `handler` once this instance is invalidated, or right away if it
    /// already is.
    pub fn on_invalidated<F>(&self, handler: F)
    where
        F: FnOnce(&Computed) + Send + 'static,
    {
        let mut handlers = self.handlers.lock();
        if self.state() == State::Invalidated {
            drop(handlers);
            handler(self);
        } else {
            handlers.push(Box::new(handler));
        }
    }

    /// Wait until this instance is invalidated.
    pub async fn when_invalidated(&self) {
        loop {
            let notified = self.notify.notified();
            if self.state() == State::Invalidated {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the computation settles. Returns `false` if it was
    /// cancelled instead.
    pub(crate) async fn settled(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            if self.aborted.load(Ordering::SeqCst) {
                return false;
            }
            if self.state() != State::Computing {
                return true;
            }
            notified.await;
        }
    }

    /// Record that this instance's computation read `used`.
    pub(crate) fn add_dependency(self: &Arc<Self>, used: &Arc<Computed>) {
        {
            let mut deps = self.dependencies.lock();
            if self.state() != State::Computing || !deps.seen.insert(used.version) {
                return;
            }
            deps.list.push(used.clone());
        }

        trace!(
            method = self.key.method().name(),
            version = self.version.0,
            used = used.version.0,
            "dependency"
        );

        used.dependents.lock().insert(self.version, Arc::downgrade(self));

        // The cascade may have drained `used` before the edge was in place.
        if used.state() == State::Invalidated {
            self.invalidate();
        }
    }

    /// Store the output and publish the instance as consistent.
    pub(crate) fn settle(self: &Arc<Self>, output: Output) {
        let expiry = match &output {
            Ok(_) => self.options.auto_invalidation_delay,
            Err(err) if err.is_transient() => {
                Some(self.options.transient_error_invalidation_delay)
            }
            Err(_) => None,
        };

        {
            // Freezes the dependencies.
            let _deps = self.dependencies.lock();
            if self.output.set(output).is_err()
                || self
                    .state
                    .compare_exchange(
                        State::Computing as u8,
                        State::Consistent as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
            {
                panic!("memograph: {:?} ({}) settled twice", self.key, self.version);
            }
        }

        self.notify.notify_waiters();
        self.publish(EventKind::Settled);

        if let Some(delay) = expiry {
            let weak = Arc::downgrade(self);
            invalidate::schedule(delay, move || {
                if let Some(computed) = weak.upgrade() {
                    computed.invalidate();
                }
            });
        }

        if self.invalidate_on_settle.load(Ordering::SeqCst) {
            self.invalidate();
        }
    }

    /// Mark the computation as cancelled and wake its waiters.
    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Flip a consistent instance to invalidated and fire its handlers.
    ///
    /// Returns the dependents to cascade to, or `None` if this call did not
    /// perform the transition. An instance that is still computing remembers
    /// the request and invalidates itself once it settles.
    pub(crate) fn mark_invalidated(&self) -> Option<Vec<Weak<Computed>>> {
        loop {
            match self.state() {
                State::Consistent => {
                    if self
                        .state
                        .compare_exchange(
                            State::Consistent as u8,
                            State::Invalidated as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                State::Computing => {
                    self.invalidate_on_settle.store(true, Ordering::SeqCst);
                    if self.state() == State::Computing {
                        return None;
                    }
                }
                State::Invalidated => return None,
            }
        }

        trace!(
            method = self.key.method().name(),
            version = self.version.0,
            "invalidated"
        );

        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers {
            handler(self);
        }

        self.notify.notify_waiters();
        self.publish(EventKind::Invalidated);

        let dependents = std::mem::take(&mut *self.dependents.lock());
        Some(dependents.into_values().collect())
    }

    fn publish(&self, kind: EventKind) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(Event {
                kind,
                key: self.key.clone(),
                version: self.version,
            });
        }
    }
}

impl Drop for Computed {
    fn drop(&mut self) {
        // Unlink from the instances this one read, so long-lived sources do
        // not collect edges to dead dependents.
        for used in self.dependencies.get_mut().list.drain(..) {
            used.dependents.lock().remove(&self.version);
        }
    }
}

impl Debug for Computed {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Computed")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Method, Target};

    fn computed(name: &str) -> Arc<Computed> {
        let method = Method::register(name, &[], ComputedOptions::DEFAULT).unwrap();
        let key = CallKey::new(Target::none(), method, vec![]);
        Computed::new(key, broadcast::channel(1).0)
    }

    #[test]
    fn test_dropped_dependents_are_unlinked() {
        let source = computed("computed::tests::source");
        source.settle(Ok(Arc::new(1u64)));

        let method = Method::register("computed::tests::reader", &[], ComputedOptions::DEFAULT)
            .unwrap();
        let mut kept = None;
        for i in 0..1000 {
            let key = CallKey::new(Target::none(), method.clone(), vec![]);
            let reader = Computed::new(key, broadcast::channel(1).0);
            reader.add_dependency(&source);
            reader.settle(Ok(Arc::new(i)));
            if i == 999 {
                kept = Some(reader);
            }
        }

        assert!(source.is_consistent());
        assert_eq!(source.dependents.lock().len(), 1);
        assert_eq!(source.dependents().len(), 1);

        drop(kept);
        assert!(source.dependents.lock().is_empty());
    }

    #[test]
    fn test_invalidated_dependents_are_unlinked() {
        let source = computed("computed::tests::invalidated_source");
        source.settle(Ok(Arc::new(1u64)));

        let reader = computed("computed::tests::invalidated_reader");
        reader.add_dependency(&source);
        reader.settle(Ok(Arc::new(2u64)));
        assert_eq!(source.dependents.lock().len(), 1);

        assert!(reader.invalidate());
        drop(reader);
        assert!(source.dependents.lock().is_empty());
        assert!(source.is_consistent());
    }
}
