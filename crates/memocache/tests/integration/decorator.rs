use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::{DELAY, Deferred, Sum, cached_reject, cached_sum, setup_memoizer};

#[tokio::test(start_paused = true)]
async fn test_miss_then_hit() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_sum(&memoizer, "forever", &deferred);

    let start = Instant::now();
    let first = cached.call(Sum::new(1, 2)).await.unwrap();
    assert_eq!(*first, 3);
    assert_eq!(start.elapsed(), DELAY);

    let start = Instant::now();
    let second = cached.call(Sum::new(1, 2)).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(deferred.calls(), 1);

    // different arguments are cached separately
    let other = cached.call(Sum::new(2, 2)).await.unwrap();
    assert_eq!(*other, 4);
    assert_eq!(deferred.calls(), 2);
    assert_eq!(cached.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_dispatch_once() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_sum(&memoizer, "forever", &deferred);

    let (a, b, c) = futures::join!(
        cached.call(Sum::new(1, 2)),
        cached.call(Sum::new(1, 2)),
        cached.call(Sum::new(1, 2)),
    );
    let a = a.unwrap();
    assert!(Arc::ptr_eq(&a, &b.unwrap()));
    assert!(Arc::ptr_eq(&a, &c.unwrap()));
    assert_eq!(deferred.calls(), 1);

    let stats = cached.stats();
    assert_eq!(stats.dispatches, 1);
    assert_eq!(stats.coalesced, 2);
}

#[tokio::test(start_paused = true)]
async fn test_almost_simultaneous_calls() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_sum(&memoizer, "age", &deferred);

    let start = Instant::now();
    let first = cached.call(Sum::new(1, 2));
    sleep(Duration::from_millis(200)).await;
    let second = cached.call(Sum::new(1, 2));

    assert_eq!(*first.await.unwrap(), 3);
    assert_eq!(*second.await.unwrap(), 3);
    // the second caller waits for the pending dispatch rather than starting its own
    assert_eq!(start.elapsed(), DELAY);
    assert_eq!(deferred.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_calls_dispatch_once() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(Duration::from_millis(100));
    let cached = Arc::new(cached_sum(&memoizer, "forever", &deferred));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cached = Arc::clone(&cached);
            tokio::spawn(async move { cached.call(Sum::new(20, 22)).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(*task.await.unwrap().unwrap(), 42);
    }
    assert_eq!(deferred.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejections_are_not_cached() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_reject(&memoizer, "forever", &deferred);

    for expected_calls in 1..=2 {
        let err = cached.call(Sum::new(1, 2)).await.unwrap_err();
        assert_eq!(err.to_string(), "refusing to add 1 and 2");
        assert_eq!(deferred.calls(), expected_calls);
        assert!(cached.is_empty());
    }
    assert_eq!(cached.stats().failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_is_shared_by_pending_callers() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_reject(&memoizer, "forever", &deferred);

    let (a, b) = futures::join!(cached.call(Sum::new(1, 2)), cached.call(Sum::new(1, 2)));
    assert!(Arc::ptr_eq(&a.unwrap_err(), &b.unwrap_err()));
    assert_eq!(deferred.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_cancel() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_sum(&memoizer, "forever", &deferred);

    drop(cached.call(Sum::new(1, 2)));
    sleep(DELAY * 2).await;

    // the dispatch ran to completion and its result was cached
    let start = Instant::now();
    assert_eq!(*cached.call(Sum::new(1, 2)).await.unwrap(), 3);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(deferred.calls(), 1);
}

#[test]
fn test_policy_errors() {
    let memoizer = setup_memoizer(|_| {});

    let err = memoizer.cache("always-miss").unwrap_err();
    assert_eq!(err.to_string(), "unknown validator `always-miss`");

    let policy = memocache::Policy::named("once-a-day").with_time("quarter past four");
    let err = memoizer.cache(policy).unwrap_err();
    assert!(matches!(err, memocache::CacheError::InvalidTime(_)));
}

#[tokio::test(start_paused = true)]
async fn test_policies_from_yaml() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);

    let yaml = r#"
        users: forever
        sessions:
          type: age
          maxAge: 10s
        reports:
          type: once-a-day
          time: "04:00:00"
    "#;
    let policies: std::collections::BTreeMap<String, memocache::Policy> =
        serde_yaml::from_str(yaml).unwrap();

    for (name, policy) in policies {
        let cached = cached_sum(&memoizer, policy.with_name(&name), &deferred);
        assert_eq!(cached.name(), name);
        assert_eq!(*cached.call(Sum::new(1, 1)).await.unwrap(), 2);
    }
    assert_eq!(memoizer.caches().len(), 3);
}
