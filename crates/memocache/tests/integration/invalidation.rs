use std::time::Duration;

use tokio::time::sleep;

use crate::{DELAY, Deferred, Sum, cached_sum, setup_memoizer};

#[tokio::test(start_paused = true)]
async fn test_invalidate_all() {
    let memoizer = setup_memoizer(|_| {});
    let sums = Deferred::new(DELAY);
    let others = Deferred::new(DELAY);
    let forever = cached_sum(&memoizer, "forever", &sums);
    let aged = cached_sum(&memoizer, "age", &others);

    for _ in 0..2 {
        forever.call(Sum::new(1, 2)).await.unwrap();
        aged.call(Sum::new(3, 4)).await.unwrap();
    }
    assert_eq!((sums.calls(), others.calls()), (1, 1));

    memoizer.invalidate_all();
    assert!(forever.is_empty());
    assert!(aged.is_empty());

    for _ in 0..2 {
        forever.call(Sum::new(1, 2)).await.unwrap();
        aged.call(Sum::new(3, 4)).await.unwrap();
    }
    assert_eq!((sums.calls(), others.calls()), (2, 2));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_single_operation() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let first = cached_sum(&memoizer, "forever", &deferred);
    let second = cached_sum(&memoizer, "forever", &deferred);

    first.call(Sum::new(1, 2)).await.unwrap();
    second.call(Sum::new(1, 2)).await.unwrap();
    assert_eq!(deferred.calls(), 2);

    first.invalidate();
    assert!(first.is_empty());
    assert_eq!(second.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_during_dispatch() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_sum(&memoizer, "forever", &deferred);

    let pending = cached.call(Sum::new(1, 2));
    sleep(Duration::from_millis(100)).await;
    memoizer.invalidate_all();

    // the dispatch is not cancelled and its callers get the result
    assert_eq!(*pending.await.unwrap(), 3);
    // but the result is not cached
    assert!(cached.is_empty());
    assert_eq!(cached.stats().discarded, 1);

    cached.call(Sum::new(1, 2)).await.unwrap();
    assert_eq!(deferred.calls(), 2);
    assert_eq!(cached.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_call_after_invalidate_during_dispatch() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);
    let cached = cached_sum(&memoizer, "forever", &deferred);

    let stale = cached.call(Sum::new(1, 2));
    sleep(Duration::from_millis(100)).await;
    memoizer.invalidate_all();

    // a call after the invalidation does not attach to the old dispatch
    let fresh = cached.call(Sum::new(1, 2));
    assert_eq!(deferred.calls(), 2);

    let (stale, fresh) = futures::join!(stale, fresh);
    assert_eq!(*stale.unwrap(), 3);
    assert_eq!(*fresh.unwrap(), 3);

    cached.call(Sum::new(1, 2)).await.unwrap();
    assert_eq!(deferred.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_operations_are_unregistered() {
    let memoizer = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);

    let kept = cached_sum(&memoizer, "forever", &deferred);
    let dropped = cached_sum(&memoizer, "forever", &deferred);
    assert_eq!(memoizer.caches().len(), 2);

    drop(dropped);
    assert_eq!(memoizer.caches().len(), 1);

    kept.call(Sum::new(1, 2)).await.unwrap();
    memoizer.invalidate_all();
    assert!(kept.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_memoizers_are_independent() {
    let first = setup_memoizer(|_| {});
    let second = setup_memoizer(|_| {});
    let deferred = Deferred::new(DELAY);

    let a = cached_sum(&first, "forever", &deferred);
    let b = cached_sum(&second, "forever", &deferred);
    a.call(Sum::new(1, 2)).await.unwrap();
    b.call(Sum::new(1, 2)).await.unwrap();

    first.invalidate_all();
    assert!(a.is_empty());
    assert_eq!(b.len(), 1);
}
