use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;

use crate::policy::BoundPolicy;
use crate::registry::{self, CacheRegistry};
use crate::store::{CacheStats, CacheStore, ComputationResult};
use crate::validators::{EntryInfo, Params, Validator, ValidatorRegistry};
use crate::{CacheConfig, CacheError, CacheKey, Policy};

/// Creates caching decorators for async operations.
///
/// A memoizer owns the validators that policies can refer to and keeps track of every cache
/// created through it, so that [`invalidate_all`](Self::invalidate_all) can reset them at once.
/// Separate memoizers are fully independent of each other.
#[derive(Debug, Default)]
pub struct Memoizer {
    config: CacheConfig,
    validators: Arc<ValidatorRegistry>,
    caches: Arc<CacheRegistry>,
}

impl Memoizer {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            validators: Default::default(),
            caches: Default::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// Registers a predicate as validator under `name`.
    ///
    /// The predicate receives the entry and the policy parameters, and returns `true` if the
    /// entry is invalid. Policies bound afterwards can select it by name.
    pub fn register_validator<F>(&self, name: impl Into<String>, predicate: F) -> Result<(), CacheError>
    where
        F: Fn(&EntryInfo, &Params) -> bool + Send + Sync + 'static,
    {
        self.validators.register_fn(name, predicate)
    }

    /// Registers a [`Validator`] implementation under `name`.
    pub fn register<V: Validator>(&self, name: impl Into<String>, validator: V) -> Result<(), CacheError> {
        self.validators.register(name, validator)
    }

    /// Creates a decorator for the given policy.
    ///
    /// The validator is resolved and the policy parameters are checked right away, so
    /// misconfigured policies fail here rather than on the first call.
    pub fn cache(&self, policy: impl Into<Policy>) -> Result<Decorator, CacheError> {
        let policy = policy.into().bind(&self.validators, &self.config)?;
        tracing::debug!(
            cache = %policy.name,
            validator = %policy.validator_name,
            "Created cache decorator",
        );

        Ok(Decorator {
            policy: Arc::new(policy),
            caches: Arc::clone(&self.caches),
        })
    }

    /// Clears the caches of all operations decorated through this memoizer.
    pub fn invalidate_all(&self) {
        self.caches.invalidate_all();
    }
}

/// A bound policy, ready to wrap operations.
///
/// Every wrapped operation gets its own cache, even if the same decorator is used for several
/// operations.
#[derive(Clone, Debug)]
pub struct Decorator {
    policy: Arc<BoundPolicy>,
    caches: Arc<CacheRegistry>,
}

impl Decorator {
    /// The name of the caches created by this decorator.
    pub fn name(&self) -> &str {
        &self.policy.name
    }

    /// Wraps `operation` into a cached operation.
    pub fn wrap<A, T, E, F, Fut>(&self, operation: F) -> CachedFn<A, T, E, F>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + Sync + 'static,
        E: From<std::io::Error> + Send + Sync + 'static,
    {
        let store = CacheStore::new(Arc::clone(&self.policy));
        let store = registry::track(&self.caches, store);

        CachedFn {
            operation,
            store,
            _args: PhantomData,
        }
    }
}

/// An operation wrapped with a cache.
///
/// Results are shared between callers, so they are handed out as `Arc`s. Errors of the
/// operation reach every caller that was waiting for the failed dispatch and are never cached.
pub struct CachedFn<A, T, E, F> {
    operation: F,
    store: Arc<CacheStore<T, E>>,
    _args: PhantomData<fn(A)>,
}

impl<A, T, E, F: Clone> Clone for CachedFn<A, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            store: Arc::clone(&self.store),
            _args: PhantomData,
        }
    }
}

impl<A, T, E, F> fmt::Debug for CachedFn<A, T, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFn")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<A, T, E, F, Fut> CachedFn<A, T, E, F>
where
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + Sync + 'static,
    E: From<std::io::Error> + Send + Sync + 'static,
{
    /// Calls the operation, or returns the cached result for the same arguments.
    ///
    /// The cache key is derived from the serialized `args`. If they cannot be serialized, the
    /// call fails with an [`InvalidInput`](std::io::ErrorKind::InvalidInput) error and the
    /// operation is not invoked.
    pub fn call(&self, args: A) -> BoxFuture<'static, ComputationResult<T, E>>
    where
        A: Serialize,
    {
        match CacheKey::from_args(&args) {
            Ok(key) => self.call_with_key(key, args),
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    cache = self.store.name(),
                    "Failed to derive cache key",
                );
                let err = std::io::Error::from(err);
                future::ready(Err(Arc::new(err.into()))).boxed()
            }
        }
    }

    /// Calls the operation using an explicit cache key.
    pub fn call_with_key(&self, key: CacheKey, args: A) -> BoxFuture<'static, ComputationResult<T, E>> {
        self.store
            .get_or_dispatch(key, || (self.operation)(args))
    }

    /// Clears the cache of this operation only.
    pub fn invalidate(&self) {
        self.store.clear();
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// The number of cached and pending entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }
}
