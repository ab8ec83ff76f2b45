use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use memocache::{CacheConfig, CachedFn, Memoizer, Policy};
use memocache_test as test;

pub use test::{CallCounter, Deferred, Sum};

/// The latency of the stub operations.
pub const DELAY: Duration = Duration::from_millis(500);

pub type SumResult = Result<u64, std::io::Error>;

pub type SumOperation = Box<dyn Fn(Sum) -> BoxFuture<'static, SumResult> + Send + Sync>;

/// A cached stub operation, as produced by [`cached_sum`] and [`cached_reject`].
pub type CachedSum = CachedFn<Sum, u64, std::io::Error, SumOperation>;

/// Setup tests and create a memoizer with the given cache configuration.
pub fn setup_memoizer(update_config: impl FnOnce(&mut CacheConfig)) -> Memoizer {
    test::setup();

    let mut config = CacheConfig::default();
    update_config(&mut config);
    Memoizer::new(config)
}

/// Decorates [`Deferred::sum`] with the given policy.
pub fn cached_sum(memoizer: &Memoizer, policy: impl Into<Policy>, deferred: &Deferred) -> CachedSum {
    let deferred = deferred.clone();
    let operation: SumOperation = Box::new(move |args| deferred.sum(args).boxed());
    memoizer.cache(policy).unwrap().wrap(operation)
}

/// Decorates [`Deferred::reject`] with the given policy.
pub fn cached_reject(memoizer: &Memoizer, policy: impl Into<Policy>, deferred: &Deferred) -> CachedSum {
    let deferred = deferred.clone();
    let operation: SumOperation = Box::new(move |args| deferred.reject(args).boxed());
    memoizer.cache(policy).unwrap().wrap(operation)
}
