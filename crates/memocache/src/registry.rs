use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::store::CacheStore;

/// A cache that can be emptied without knowing its value types.
pub trait ClearCache: Send + Sync {
    /// Removes all entries.
    fn clear(&self);

    /// The name of the cache, for logging.
    fn name(&self) -> &str;
}

impl<T, E> ClearCache for CacheStore<T, E>
where
    T: Send + Sync + 'static,
    E: From<std::io::Error> + Send + Sync + 'static,
{
    fn clear(&self) {
        CacheStore::clear(self)
    }

    fn name(&self) -> &str {
        CacheStore::name(self)
    }
}

/// Tracks all cache stores created by the decorators of one [`Memoizer`](crate::Memoizer).
///
/// The registry only holds weak references, stores are dropped together with the last
/// [`CachedFn`](crate::CachedFn) using them.
#[derive(Default)]
pub struct CacheRegistry {
    stores: Mutex<Vec<Weak<dyn ClearCache>>>,
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("stores", &self.len())
            .finish()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a store to the registry.
    pub fn register(&self, store: Weak<dyn ClearCache>) {
        let mut stores = self.stores.lock().unwrap();
        stores.retain(|store| store.strong_count() > 0);
        stores.push(store);
    }

    /// Clears every live store.
    ///
    /// The registry stays locked for the whole sweep, so stores registered concurrently are
    /// either cleared or start out empty. Pending computations are not cancelled, but their
    /// results will not be cached.
    pub fn invalidate_all(&self) {
        let mut stores = self.stores.lock().unwrap();
        stores.retain(|store| store.strong_count() > 0);

        let mut cleared = 0;
        for store in stores.iter().filter_map(Weak::upgrade) {
            tracing::trace!(cache = store.name(), "Invalidating cache");
            store.clear();
            cleared += 1;
        }
        drop(stores);

        metric!(counter("caches.invalidate_all") += 1);
        tracing::debug!(caches = cleared, "Invalidated all caches");
    }

    /// The number of live stores.
    pub fn len(&self) -> usize {
        self.stores
            .lock()
            .unwrap()
            .iter()
            .filter(|store| store.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers `store` with `registry` and hands it back.
pub(crate) fn track<S: ClearCache + 'static>(registry: &CacheRegistry, store: S) -> Arc<S> {
    let store = Arc::new(store);
    let weak = Arc::downgrade(&store);
    registry.register(weak);
    store
}
