use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memograph::{ArgType, CallKey, ComputedOptions, Config, Method, Registry, Target, arg};

fn setup(name: &str, keep_alive: Duration) -> (Registry, impl Fn(u64) -> CallKey) {
    let options = ComputedOptions::DEFAULT.with_keep_alive(keep_alive);
    let method = Method::register(name, &[ArgType::of::<u64>()], options).unwrap();
    let key = move |n: u64| CallKey::new(Target::none(), method.clone(), vec![arg(n)]);
    (Registry::new(Config::default().with_shards(4)), key)
}

/// Test that unused instances are dropped and swept.
#[tokio::test]
async fn test_weak_eviction() {
    let (registry, key) = setup("keep_alive::weak", Duration::ZERO);

    let computed = registry.get_or_compute(key(1), || async { Ok(1u64) }).await.unwrap();
    assert!(registry.get(&key(1)).is_some());

    drop(computed);
    assert!(registry.get(&key(1)).is_none());
    assert_eq!(registry.len(), 1);

    assert_eq!(registry.sweep(), 1);
    assert!(registry.is_empty());
}

/// Test that a pinned instance survives a lull and expires afterwards.
#[tokio::test(start_paused = true)]
async fn test_keep_alive() {
    let (registry, key) = setup("keep_alive::pinned", Duration::from_secs(10));
    let runs = AtomicUsize::new(0);
    let compute = || {
        runs.fetch_add(1, Ordering::SeqCst);
        async { Ok(1u64) }
    };

    drop(registry.get_or_compute(key(1), compute).await.unwrap());
    tokio::time::advance(Duration::from_secs(5)).await;
    registry.sweep();
    assert!(registry.get(&key(1)).is_some());

    // A hit extends the window.
    drop(registry.get_or_compute(key(1), compute).await.unwrap());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    registry.sweep();
    assert!(registry.get(&key(1)).is_some());

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(registry.sweep(), 1);
    assert!(registry.get(&key(1)).is_none());

    drop(registry.get_or_compute(key(1), compute).await.unwrap());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that an invalidated instance is not kept alive.
#[tokio::test(start_paused = true)]
async fn test_invalidated_instances_are_released() {
    let (registry, key) = setup("keep_alive::invalidated", Duration::from_secs(60));

    let computed = registry.get_or_compute(key(1), || async { Ok(1u64) }).await.unwrap();
    let weak = Arc::downgrade(&computed);
    computed.invalidate();
    drop(computed);

    assert!(weak.upgrade().is_some());
    registry.sweep();
    assert!(weak.upgrade().is_none());
}

/// Test the periodic sweeper.
#[tokio::test(start_paused = true)]
async fn test_sweeper() {
    let (registry, key) = setup("keep_alive::sweeper", Duration::from_secs(2));
    let sweeper = registry.spawn_sweeper(Duration::from_secs(1));

    drop(registry.get_or_compute(key(1), || async { Ok(1u64) }).await.unwrap());
    drop(registry.get_or_compute(key(2), || async { Ok(2u64) }).await.unwrap());
    assert_eq!(registry.len(), 2);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(registry.is_empty());

    drop(registry);
    sweeper.await.unwrap();
}

/// Test that lookups sweep incrementally.
#[tokio::test]
async fn test_incremental_sweep() {
    let options = ComputedOptions::DEFAULT;
    let method = Method::register("keep_alive::incremental", &[ArgType::of::<u64>()], options)
        .unwrap();
    let key = |n: u64| CallKey::new(Target::none(), method.clone(), vec![arg(n)]);
    let registry = Registry::new(Config::default().with_shards(1).with_sweep_period(8));

    for n in 0..64 {
        registry.get_or_compute(key(n), || async move { Ok(n) }).await.unwrap();
    }

    assert!(registry.len() <= 8);
}
