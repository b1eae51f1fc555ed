use std::time::Duration;

/// Per-method caching behaviour.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ComputedOptions {
    /// How long an instance stays alive after its last use even if nothing
    /// else references it.
    pub keep_alive: Duration,
    /// Delay between an instance's invalidation and the invalidation of its
    /// dependents.
    pub invalidation_delay: Duration,
    /// If set, consistent instances invalidate themselves this long after
    /// settling.
    pub auto_invalidation_delay: Option<Duration>,
    /// How long a transient error stays cached.
    pub transient_error_invalidation_delay: Duration,
}

impl ComputedOptions {
    pub const DEFAULT: Self = Self {
        keep_alive: Duration::ZERO,
        invalidation_delay: Duration::ZERO,
        auto_invalidation_delay: None,
        transient_error_invalidation_delay: Duration::from_secs(1),
    };

    pub const fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub const fn with_invalidation_delay(mut self, delay: Duration) -> Self {
        self.invalidation_delay = delay;
        self
    }

    pub const fn with_auto_invalidation(mut self, delay: Duration) -> Self {
        self.auto_invalidation_delay = Some(delay);
        self
    }

    pub const fn with_transient_error_invalidation(mut self, delay: Duration) -> Self {
        self.transient_error_invalidation_delay = delay;
        self
    }
}

impl Default for ComputedOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}
