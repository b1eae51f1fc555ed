/*!
Reactive memoization with automatic dependency tracking.

Memograph caches the results of async functions and methods. Every cached
result is a [`Computed`] instance. While a computation runs, each memoized
call it makes is recorded as a dependency. Invalidating an instance then
invalidates everything that was computed from it, transitively, so the next
call recomputes exactly what is stale.

# Example
```
# #[tokio::main(flavor = "current_thread")]
# async fn main() {
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Prices {
    base: AtomicU64,
}

impl Prices {
    #[memograph::computed(keep_alive_ms = 60_000)]
    async fn base(self: &Arc<Self>) -> memograph::Result<u64> {
        Ok(self.base.load(Ordering::SeqCst))
    }

    #[memograph::computed(keep_alive_ms = 60_000)]
    async fn with_tax(self: &Arc<Self>, percent: u64) -> memograph::Result<u64> {
        let base = self.base().await?;
        Ok(base + base * percent / 100)
    }
}

let prices = Arc::new(Prices { base: AtomicU64::new(100) });
assert_eq!(prices.with_tax(20).await.unwrap(), 120);

// Change the source and invalidate the instance that read it. The
// dependent `with_tax(20)` is invalidated along with it.
prices.base.store(200, Ordering::SeqCst);
memograph::context::invalidating(async {
    let _ = prices.base().await;
})
.await;

assert_eq!(prices.with_tax(20).await.unwrap(), 240);
# }
```

# Keys
A call is identified by its target (the service it was invoked on, compared
by identity), its method and its arguments. Arguments are compared by the
[comparer](comparer) registered for their type. Declaring a memoized method
with an argument type that has no comparer fails when the method is first
registered.

# Lifetime
The [`Registry`] only holds weak references. An instance stays cached as long
as something uses it, and for its method's `keep_alive` duration after its
last use.
*/

pub mod comparer;
pub mod context;
mod computed;
mod error;
mod hash;
mod invalidate;
mod key;
mod options;
mod registry;
#[cfg(feature = "testing")]
mod testing;

pub use crate::comparer::{Comparer, Identity};
pub use crate::computed::{Computed, Event, EventKind, Output, State, Version};
pub use crate::context::CallMode;
pub use crate::error::{ConfigError, Error, Result};
pub use crate::key::{ArgType, CallKey, Method, MethodCell, Target, arg};
pub use crate::options::ComputedOptions;
pub use crate::registry::{Config, Registry, call};

#[cfg(feature = "macros")]
pub use memograph_macros::computed;

/// These are implementation details. Do not rely on them!
#[doc(hidden)]
pub mod internal {
    pub use crate::key::{ArgType, CallKey, Method, MethodCell, Target, arg};
    pub use crate::options::ComputedOptions;
    pub use crate::registry::call;

    #[cfg(feature = "testing")]
    pub use crate::testing::{computations, last_was_hit};
}
