use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use memograph::{
    ArgType, CallKey, ComputedOptions, Config, Error, EventKind, Method, Registry, State, Target,
    arg,
};

fn method(name: &str) -> Arc<Method> {
    Method::register(name, &[ArgType::of::<u64>()], ComputedOptions::DEFAULT).unwrap()
}

fn key(method: &Arc<Method>, n: u64) -> CallKey {
    CallKey::new(Target::none(), method.clone(), vec![arg(n)])
}

/// Test the basic lifecycle of one key.
#[tokio::test]
async fn test_compute_hit_invalidate_recompute() {
    let registry = Registry::new(Config::default());
    let m = method("registry::lifecycle");

    let first = registry.get_or_compute(key(&m, 1), || async { Ok(1u64) }).await.unwrap();
    assert_eq!(first.value::<u64>().unwrap().unwrap(), 1);
    assert_eq!(first.state(), State::Consistent);

    let again = registry
        .get_or_compute::<u64, _, _>(key(&m, 1), || async { unreachable!("expected a hit") })
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.version(), again.version());

    assert!(first.invalidate());
    assert_eq!(first.state(), State::Invalidated);

    let next = registry.get_or_compute(key(&m, 1), || async { Ok(1u64) }).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &next));
    assert!(next.version() > first.version());
    assert_eq!(next.value::<u64>().unwrap().unwrap(), 1);
    assert_eq!(first.state(), State::Invalidated);
}

/// Test that concurrent callers share one computation.
#[tokio::test]
async fn test_single_flight() {
    let registry = Registry::new(Config::default());
    let m = method("registry::single_flight");
    let runs = Arc::new(AtomicUsize::new(0));

    let calls = (0..16).map(|_| {
        let runs = runs.clone();
        registry.get_or_compute(key(&m, 7), move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(49u64)
        })
    });

    let results = join_all(calls).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
}

/// Test that concurrent calls share one computation even when nothing keeps
/// the instance alive afterwards.
#[tokio::test]
async fn test_single_flight_without_keep_alive() {
    let registry = Registry::new(Config::default());
    let m = method("registry::single_flight_call");
    let runs = Arc::new(AtomicUsize::new(0));

    let calls = (0..16).map(|_| {
        let runs = runs.clone();
        registry.call(key(&m, 7), move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(49u64)
        })
    });

    for result in join_all(calls).await {
        assert_eq!(result.unwrap(), 49);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Every caller dropped its handle, so the next call computes again.
    assert!(registry.get(&key(&m, 7)).is_none());
}

/// Test that different arguments are computed separately.
#[tokio::test]
async fn test_distinct_keys() {
    let registry = Registry::new(Config::default());
    let m = method("registry::distinct");

    let a = registry.get_or_compute(key(&m, 1), || async { Ok(10u64) }).await.unwrap();
    let b = registry.get_or_compute(key(&m, 2), || async { Ok(20u64) }).await.unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(b.value::<u64>().unwrap().unwrap(), 20);
    assert_eq!(registry.len(), 2);
}

/// Test that errors are cached until invalidated.
#[tokio::test]
async fn test_errors_are_cached() {
    let registry = Registry::new(Config::default());
    let m = method("registry::errors");
    let runs = AtomicUsize::new(0);
    let compute = || {
        runs.fetch_add(1, Ordering::SeqCst);
        async { Err::<u64, _>(Error::msg("boom")) }
    };

    let first = registry.get_or_compute(key(&m, 1), compute).await.unwrap();
    assert_eq!(first.value::<u64>().unwrap().unwrap_err().to_string(), "boom");

    let again = registry.get_or_compute(key(&m, 1), compute).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    first.invalidate();
    registry.get_or_compute(key(&m, 1), compute).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a panicking computation settles to an error.
#[tokio::test]
async fn test_panics_are_cached() {
    let registry = Registry::new(Config::default());
    let m = method("registry::panics");

    let computed = registry
        .get_or_compute::<u64, _, _>(key(&m, 1), || async { panic!("kaboom") })
        .await
        .unwrap();

    assert!(matches!(
        computed.output(),
        Some(Err(Error::Panic { message })) if message == "kaboom"
    ));
    assert_eq!(computed.state(), State::Consistent);
}

/// Test that a cancelled computation leaves nothing behind.
#[tokio::test]
async fn test_cancellation_rolls_back() {
    let registry = Registry::new(Config::default());
    let m = method("registry::cancelled");

    let result = registry
        .get_or_compute(key(&m, 1), || async { Err::<u64, _>(Error::Cancelled) })
        .await;
    assert!(result.unwrap_err().is_cancelled());
    assert!(registry.get(&key(&m, 1)).is_none());

    let computed = registry.get_or_compute(key(&m, 1), || async { Ok(3u64) }).await.unwrap();
    assert_eq!(computed.value::<u64>().unwrap().unwrap(), 3);
}

/// Test that cancelling a recomputation restores the previous instance.
#[tokio::test]
async fn test_cancellation_restores_previous() {
    let registry = Registry::new(Config::default());
    let m = method("registry::restore");

    let old = registry.get_or_compute(key(&m, 1), || async { Ok(1u64) }).await.unwrap();
    old.invalidate();

    let result = registry
        .get_or_compute(key(&m, 1), || async { Err::<u64, _>(Error::Cancelled) })
        .await;
    assert!(result.is_err());

    let current = registry.get(&key(&m, 1)).unwrap();
    assert!(Arc::ptr_eq(&old, &current));
}

/// Test that waiters retry when the producer is dropped.
#[tokio::test(start_paused = true)]
async fn test_waiters_retry_after_producer_is_dropped() {
    let registry = Registry::new(Config::default());
    let m = method("registry::dropped_producer");

    let producer = async {
        let slow = registry.get_or_compute(key(&m, 1), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u64)
        });
        tokio::time::timeout(Duration::from_secs(1), slow).await
    };

    let waiter = async {
        tokio::task::yield_now().await;
        registry.get_or_compute(key(&m, 1), || async { Ok(2u64) }).await
    };

    let (produced, waited) = tokio::join!(producer, waiter);
    assert!(produced.is_err());

    let computed = waited.unwrap();
    assert_eq!(computed.value::<u64>().unwrap().unwrap(), 2);
    assert!(Arc::ptr_eq(&computed, &registry.get(&key(&m, 1)).unwrap()));
}

/// Test that a computation requesting itself fails instead of deadlocking.
#[tokio::test]
async fn test_cycle_is_detected() {
    let registry = Registry::new(Config::default());
    let m = method("registry::cycle");

    let inner = registry.clone();
    let inner_key = key(&m, 1);
    let computed = registry
        .get_or_compute(key(&m, 1), move || async move {
            inner.call::<u64, _, _>(inner_key, || async { Ok(0) }).await
        })
        .await
        .unwrap();

    assert!(matches!(computed.output(), Some(Err(Error::Cycle { .. }))));
}

/// Test that settlement and invalidation are published.
#[tokio::test]
async fn test_events() {
    let registry = Registry::new(Config::default());
    let m = method("registry::events");
    let mut events = registry.subscribe();

    let computed = registry.get_or_compute(key(&m, 5), || async { Ok(5u64) }).await.unwrap();
    computed.invalidate();

    let settled = events.recv().await.unwrap();
    assert_eq!(settled.kind, EventKind::Settled);
    assert_eq!(settled.version, computed.version());
    assert_eq!(settled.key, key(&m, 5));

    let invalidated = events.recv().await.unwrap();
    assert_eq!(invalidated.kind, EventKind::Invalidated);
    assert_eq!(invalidated.version, computed.version());
}

/// Test invalidation through the registry.
#[tokio::test]
async fn test_registry_invalidate() {
    let registry = Registry::new(Config::default());
    let m = method("registry::invalidate");

    assert!(!registry.invalidate(&key(&m, 1)));
    let computed = registry.get_or_compute(key(&m, 1), || async { Ok(1u64) }).await.unwrap();
    assert!(registry.invalidate(&key(&m, 1)));
    assert!(!registry.invalidate(&key(&m, 1)));
    assert_eq!(computed.state(), State::Invalidated);
}
