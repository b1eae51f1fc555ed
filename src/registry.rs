use std::any::Any;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::computed::{Computed, Event, Output, State};
use crate::context::{self, CallMode, Frame};
use crate::error::Error;
use crate::hash::KeyMap;
use crate::key::CallKey;

/// The process-wide registry used by generated wrappers.
static GLOBAL: LazyLock<Registry> = LazyLock::new(|| Registry::new(Config::default()));

/// Call a memoized function through the global registry.
pub async fn call<T, F, Fut>(key: CallKey, compute: F) -> Result<T, Error>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    Registry::global().call(key, compute).await
}

/// Tuning knobs for a [`Registry`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of independently locked shards of the table.
    pub shards: usize,
    /// Every this many lookups, one shard is swept.
    pub sweep_period: usize,
    /// How many events a slow subscriber may lag behind.
    pub event_capacity: usize,
}

impl Config {
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_sweep_period(mut self, period: usize) -> Self {
        self.sweep_period = period;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            shards: (parallelism * 4).next_power_of_two(),
            sweep_period: 1024,
            event_capacity: 1024,
        }
    }
}

/// The table from call keys to their latest computed instance.
///
/// The table only holds weak references. An instance stays cached while
/// something uses it, plus its method's keep-alive duration after its last
/// use. Dead entries are dropped lazily by sweeps.
///
/// Cloning a registry yields another handle to the same table.
#[derive(Clone)]
pub struct Registry(Arc<Inner>);

struct Inner {
    shards: Box<[RwLock<Shard>]>,
    config: Config,
    events: broadcast::Sender<Event>,
    /// Lookups so far, for scheduling incremental sweeps.
    ops: AtomicUsize,
}

type Shard = KeyMap<Slot>;

/// The table entry for one key.
struct Slot {
    computed: Weak<Computed>,
    /// Keeps a recently used instance alive until a deadline.
    pin: Mutex<Option<Pin>>,
}

struct Pin {
    until: Instant,
    computed: Arc<Computed>,
}

impl Slot {
    fn new(computed: &Arc<Computed>) -> Self {
        Self { computed: Arc::downgrade(computed), pin: Mutex::new(None) }
    }

    fn holds(&self, computed: &Arc<Computed>) -> bool {
        self.computed.as_ptr() == Arc::as_ptr(computed)
    }

    /// Extend the keep-alive window of `computed`.
    fn touch(&self, computed: &Arc<Computed>) {
        let keep_alive = computed.options().keep_alive;
        if keep_alive.is_zero() {
            return;
        }

        let until = Instant::now() + keep_alive;
        let mut pin = self.pin.lock();
        match &mut *pin {
            Some(pin) if Arc::ptr_eq(&pin.computed, computed) => pin.until = until,
            _ => *pin = Some(Pin { until, computed: computed.clone() }),
        }
    }
}

/// The outcome of looking up a key.
enum Begin {
    /// A consistent instance.
    Hit(Arc<Computed>),
    /// Another caller is computing.
    Wait(Arc<Computed>),
    /// This caller computes.
    Produce(Flight),
}

impl Registry {
    pub fn new(config: Config) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| RwLock::new(Shard::default()))
            .collect();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self(Arc::new(Inner { shards, config, events, ops: AtomicUsize::new(0) }))
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Subscribe to settlement and invalidation events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.0.events.subscribe()
    }

    /// The current instance for `key`, in whatever state it is.
    pub fn get(&self, key: &CallKey) -> Option<Arc<Computed>> {
        self.shard(key).read().get(key)?.computed.upgrade()
    }

    /// Invalidate the current instance for `key`.
    pub fn invalidate(&self, key: &CallKey) -> bool {
        self.get(key).is_some_and(|computed| computed.invalidate())
    }

    /// The number of entries, including dead ones not yet swept.
    pub fn len(&self) -> usize {
        self.0.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call a memoized function and return its value.
    ///
    /// This is what interception wrappers call. It honours the
    /// [call mode](crate::context::CallMode) of the current scope and records
    /// the result as a dependency of the current computation.
    pub async fn call<T, F, Fut>(&self, key: CallKey, compute: F) -> Result<T, Error>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let frame = Frame::current();
        match frame.mode() {
            CallMode::Compute => {}
            CallMode::Invalidate => {
                if let Some(computed) = self.get(&key) {
                    computed.invalidate();
                }
                return Err(Error::NotComputed);
            }
            CallMode::Existing => {
                let computed = self
                    .get(&key)
                    .filter(|computed| computed.is_consistent())
                    .ok_or(Error::NotComputed)?;
                frame.capture(&computed);
                return computed.use_value().await;
            }
        }

        let computed = self.get_or_compute(key, compute).await?;
        frame.capture(&computed);
        computed.use_value().await
    }

    /// Return the consistent instance for `key`, computing it if necessary.
    ///
    /// Concurrent callers with equal keys share a single computation. The
    /// returned error is only ever a cancellation or a cycle. Failures of the
    /// computation itself are cached in the instance's output.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: CallKey,
        compute: F,
    ) -> Result<Arc<Computed>, Error>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let flight = loop {
            match self.begin(&key) {
                Begin::Hit(computed) => {
                    trace!(key = ?key, version = computed.version().get(), "hit");

                    #[cfg(feature = "testing")]
                    crate::testing::register_hit();

                    return Ok(computed);
                }
                Begin::Wait(computed) => {
                    if Frame::current().is_within(&computed) {
                        return Err(Error::Cycle { method: key.method().name().into() });
                    }
                    trace!(key = ?key, version = computed.version().get(), "wait");

                    // Only a cancelled or already invalidated producer sends
                    // waiters back to the table.
                    if computed.settled().await && computed.is_consistent() {
                        #[cfg(feature = "testing")]
                        crate::testing::register_hit();

                        return Ok(computed);
                    }
                }
                Begin::Produce(flight) => break flight,
            }
        };

        let computed = flight.computed.clone();
        let version = computed.version().get();
        debug!(key = ?key, version, "compute: start");

        let result = AssertUnwindSafe(context::computing(computed.clone(), async move {
            compute().await
        }))
        .catch_unwind()
        .await;

        let output: Output = match result {
            Ok(Ok(value)) => {
                debug!(key = ?key, version, "compute: ok");
                Ok(Arc::new(value))
            }
            Ok(Err(Error::Cancelled)) => {
                debug!(key = ?key, version, "compute: cancelled");
                return Err(Error::Cancelled);
            }
            Ok(Err(err)) => {
                debug!(key = ?key, version, error = %err, "compute: err");
                Err(err)
            }
            Err(payload) => {
                let message = panic_message(payload);
                debug!(key = ?key, version, message = %message, "compute: panic");
                Err(Error::Panic { message })
            }
        };

        flight.complete(output);

        #[cfg(feature = "testing")]
        crate::testing::register_miss();

        Ok(computed)
    }

    /// Look up `key` and decide whether to return, wait or compute.
    fn begin(&self, key: &CallKey) -> Begin {
        self.tick();
        let shard = self.shard(key);

        {
            let shard = shard.read();
            if let Some(slot) = shard.get(key)
                && let Some(begin) = Self::reuse(slot)
            {
                return begin;
            }
        }

        let mut shard = shard.write();
        let (computed, previous) = match shard.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if let Some(begin) = Self::reuse(slot) {
                    return begin;
                }

                let computed = Computed::new(key.clone(), self.0.events.clone());
                let previous = std::mem::replace(&mut slot.computed, Arc::downgrade(&computed));
                slot.pin.get_mut().take();
                (computed, previous)
            }
            Entry::Vacant(entry) => {
                let computed = Computed::new(key.clone(), self.0.events.clone());
                entry.insert(Slot::new(&computed));
                (computed, Weak::new())
            }
        };

        Begin::Produce(Flight {
            registry: self.clone(),
            key: key.clone(),
            computed,
            previous,
            done: false,
        })
    }

    /// Whether a slot's instance can be returned or waited on.
    fn reuse(slot: &Slot) -> Option<Begin> {
        let computed = slot.computed.upgrade()?;
        match computed.state() {
            State::Consistent => {
                slot.touch(&computed);
                Some(Begin::Hit(computed))
            }
            State::Computing => Some(Begin::Wait(computed)),
            State::Invalidated => None,
        }
    }

    fn shard(&self, key: &CallKey) -> &RwLock<Shard> {
        let shards = &self.0.shards;
        &shards[(key.hash128() >> 64) as usize % shards.len()]
    }

    /// Count a lookup and sweep one shard every `sweep_period` lookups.
    fn tick(&self) {
        let period = self.0.config.sweep_period.max(1);
        let n = self.0.ops.fetch_add(1, Ordering::Relaxed);
        if n % period == period - 1 {
            self.sweep_shard((n / period) % self.0.shards.len());
        }
    }

    /// Release expired keep-alive pins and drop entries whose instance is
    /// gone. Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let removed = (0..self.0.shards.len()).map(|i| self.sweep_shard(i)).sum();
        debug!(removed, remaining = self.len(), "sweep");
        removed
    }

    fn sweep_shard(&self, index: usize) -> usize {
        let now = Instant::now();
        let mut shard = self.0.shards[index].write();
        let before = shard.len();
        shard.retain(|_, slot| {
            let pin = slot.pin.get_mut();
            if pin.as_ref().is_some_and(|pin| {
                pin.until <= now || pin.computed.state() == State::Invalidated
            }) {
                *pin = None;
            }
            slot.computed.strong_count() > 0
        });
        before - shard.len()
    }

    /// Sweep the registry every `period` on the current runtime.
    ///
    /// The task ends once the registry is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.0);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = registry.upgrade() else { break };
                Registry(inner).sweep();
            }
        })
    }

    /// Pin a freshly settled instance.
    fn touch(&self, key: &CallKey, computed: &Arc<Computed>) {
        if computed.options().keep_alive.is_zero() {
            return;
        }
        if let Some(slot) = self.shard(key).read().get(key)
            && slot.holds(computed)
        {
            slot.touch(computed);
        }
    }
}

/// An in-flight computation owned by the caller that started it.
///
/// Dropping it before completion, because the computation was cancelled or
/// the caller's future was dropped, hands the key back to whatever was
/// cached before.
struct Flight {
    registry: Registry,
    key: CallKey,
    computed: Arc<Computed>,
    previous: Weak<Computed>,
    done: bool,
}

impl Flight {
    fn complete(mut self, output: Output) {
        self.done = true;
        self.computed.settle(output);
        self.registry.touch(&self.key, &self.computed);
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        {
            let mut shard = self.registry.shard(&self.key).write();
            if let Some(slot) = shard.get_mut(&self.key)
                && slot.holds(&self.computed)
            {
                if self.previous.strong_count() > 0 {
                    slot.computed = std::mem::take(&mut self.previous);
                } else {
                    shard.remove(&self.key);
                }
            }
        }

        self.computed.abort();
        debug!(key = ?self.key, version = self.computed.version().get(), "compute: rolled back");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".into(),
        },
    }
}
