use std::sync::{Arc, Mutex};
use std::time::Duration;

use memocache::{CacheKey, Policy};
use tokio::time::{Instant, sleep};

use crate::{CallCounter, Deferred, Sum, cached_reject, cached_sum, setup_memoizer};

fn counting_policy(validator: &str) -> (Policy, CallCounter) {
    let counter = CallCounter::new();
    let hits = counter.clone();
    let policy = Policy::named(validator).on_slow(move |_key| hits.hit());
    (policy, counter)
}

#[tokio::test(start_paused = true)]
async fn test_fires_once_for_slow_dispatch() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(Duration::from_secs(3));
    let (policy, fired) = counting_policy("forever");
    let cached = cached_sum(&memoizer, policy, &deferred);

    let start = Instant::now();
    assert_eq!(*cached.call(Sum::new(1, 2)).await.unwrap(), 3);
    // the watchdog neither delays nor shortens the dispatch
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(fired.get(), 1);
    assert_eq!(cached.stats().slow, 1);

    // never for hits
    cached.call(Sum::new(1, 2)).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(fired.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_for_fast_dispatch() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(Duration::from_millis(500));
    let (policy, fired) = counting_policy("forever");
    let cached = cached_sum(&memoizer, policy, &deferred);

    cached.call(Sum::new(1, 2)).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(fired.get(), 0);
    assert_eq!(cached.stats().slow, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fires_once_for_coalesced_callers() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(Duration::from_secs(3));
    let (policy, fired) = counting_policy("forever");
    let cached = cached_sum(&memoizer, policy, &deferred);

    let (a, b) = futures::join!(cached.call(Sum::new(1, 2)), cached.call(Sum::new(1, 2)));
    a.unwrap();
    b.unwrap();
    assert_eq!(fired.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fires_again_after_invalidation() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(Duration::from_secs(3));
    let (policy, fired) = counting_policy("forever");
    let cached = cached_sum(&memoizer, policy, &deferred);

    cached.call(Sum::new(1, 2)).await.unwrap();
    assert_eq!(fired.get(), 1);

    memoizer.invalidate_all();
    cached.call(Sum::new(1, 2)).await.unwrap();
    assert_eq!(fired.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fires_for_slow_rejection() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(Duration::from_secs(2));
    let (policy, fired) = counting_policy("forever");
    let cached = cached_reject(&memoizer, policy, &deferred);

    assert!(cached.call(Sum::new(1, 2)).await.is_err());
    assert_eq!(fired.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_threshold_and_key() {
    let memoizer = setup_memoizer(|config| config.slow_threshold = Duration::from_secs(5));
    let deferred = Deferred::new(Duration::from_secs(6));

    let start = Instant::now();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&reports);
    let policy = Policy::named("forever").on_slow(move |key: &CacheKey| {
        log.lock().unwrap().push((key.clone(), start.elapsed()));
    });
    let cached = cached_sum(&memoizer, policy, &deferred);

    cached.call(Sum::new(1, 2)).await.unwrap();

    let reports = reports.lock().unwrap();
    let expected_key = CacheKey::from_args(&Sum::new(1, 2)).unwrap();
    assert_eq!(*reports, [(expected_key, Duration::from_secs(5))]);
}
