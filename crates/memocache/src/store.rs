use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use tokio::time::Instant;

use crate::policy::BoundPolicy;
use crate::utils::futures::CallOnDrop;
use crate::validators::EntryInfo;
use crate::CacheKey;

/// The shared outcome of a single dispatch.
pub type ComputationResult<T, E> = Result<Arc<T>, Arc<E>>;

// Inner result necessary because `futures::Shared` won't give us `Arc`s but its own custom
// newtype around it.
type ComputationChannel<T, E> = Shared<oneshot::Receiver<ComputationResult<T, E>>>;

enum EntryState<T, E> {
    /// The operation was dispatched and has not settled yet.
    Pending(ComputationChannel<T, E>),
    /// The operation settled successfully.
    Settled(Arc<T>),
}

struct CacheEntry<T, E> {
    info: EntryInfo,
    /// Identifies the dispatch that created this entry.
    generation: u64,
    state: EntryState<T, E>,
}

enum Lookup<T, E> {
    Hit(Arc<T>),
    Pending(ComputationChannel<T, E>),
    Miss,
}

/// Counters describing how a [`CacheStore`] was used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// All calls.
    pub accesses: u64,
    /// Calls served from a settled entry.
    pub hits: u64,
    /// Calls that attached to a pending dispatch.
    pub coalesced: u64,
    /// Dispatches of the wrapped operation.
    pub dispatches: u64,
    /// Dispatches that settled with an error.
    pub failures: u64,
    /// Dispatches that triggered the slow callback.
    pub slow: u64,
    /// Successful dispatches whose result was dropped because the store was cleared meanwhile.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    accesses: AtomicU64,
    hits: AtomicU64,
    coalesced: AtomicU64,
    dispatches: AtomicU64,
    failures: AtomicU64,
    slow: AtomicU64,
    discarded: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            accesses: self.accesses.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Maps cache keys to the entries of one decorated operation.
///
/// Every key is either absent, pending (the operation was dispatched and not yet settled) or
/// settled (the value is cached). All state transitions happen under a single lock, which
/// guarantees that at most one dispatch per key is outstanding at any time.
///
/// Dispatched operations run as separate tasks on the tokio runtime. They run to completion
/// even if all callers lose interest, or if the store is cleared in the meantime. In the latter
/// case, the result is handed to the callers that were waiting for it, but not cached.
pub struct CacheStore<T, E> {
    policy: Arc<BoundPolicy>,
    entries: Mutex<HashMap<CacheKey, CacheEntry<T, E>>>,
    generation: AtomicU64,
    stats: StatCounters,
}

impl<T, E> fmt::Debug for CacheStore<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("CacheStore")
            .field("policy", &self.policy)
            .field("entries", &entries)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<T, E> CacheStore<T, E>
where
    T: Send + Sync + 'static,
    E: From<std::io::Error> + Send + Sync + 'static,
{
    pub(crate) fn new(policy: Arc<BoundPolicy>) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stats: StatCounters::default(),
        }
    }

    /// The name of this cache, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.policy.name
    }

    /// Returns the cached value for `key`, or dispatches a computation to produce it.
    ///
    /// - A settled entry that the policy considers valid is returned right away.
    /// - A pending entry is shared: the caller waits for the outstanding dispatch.
    /// - Otherwise `dispatch` is invoked to start the operation, which is then run as a
    ///   separate task. A successful result is cached, an error is handed to all waiting
    ///   callers and the entry is removed again.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation on the runtime, even if you don't explicitly `await` its results.
    pub fn get_or_dispatch<F, Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        dispatch: F,
    ) -> BoxFuture<'static, ComputationResult<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.name();
        StatCounters::bump(&self.stats.accesses);
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut entries = self.entries.lock().unwrap();
        let lookup = match entries.get(&key) {
            Some(CacheEntry {
                state: EntryState::Pending(channel),
                ..
            }) => Lookup::Pending(channel.clone()),
            Some(CacheEntry {
                state: EntryState::Settled(value),
                info,
                ..
            }) => {
                if self.policy.is_invalid(info) {
                    tracing::trace!(cache = name, key = %key, "Cache entry is invalid");
                    Lookup::Miss
                } else {
                    Lookup::Hit(Arc::clone(value))
                }
            }
            None => Lookup::Miss,
        };

        let channel = match lookup {
            Lookup::Hit(value) => {
                drop(entries);
                StatCounters::bump(&self.stats.hits);
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, key = %key, "Cache hit");
                return future::ready(Ok(value)).boxed();
            }
            Lookup::Pending(channel) => {
                drop(entries);
                // A concurrent computation was deduplicated.
                StatCounters::bump(&self.stats.coalesced);
                metric!(counter("caches.channel.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, key = %key, "Attaching to pending computation");
                channel
            }
            Lookup::Miss => {
                metric!(counter("caches.channel.miss") += 1, "cache" => name);

                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let entry = CacheEntry {
                    info: EntryInfo::new(key.clone()),
                    generation,
                    state: EntryState::Pending(channel.clone()),
                };
                entries.insert(key.clone(), entry);
                // The operation is invoked only after releasing the lock, the pending entry
                // already deduplicates concurrent callers.
                drop(entries);

                // Evicts the pending entry if the operation panics, either while creating its
                // future or while the task runs, so the next caller dispatches again instead of
                // waiting on a dead channel.
                let remove_computation_token = {
                    let store = Arc::clone(self);
                    let key = key.clone();
                    CallOnDrop::new(move || store.remove_pending(&key, generation))
                };

                let computation = dispatch();
                self.spawn_computation(
                    key,
                    generation,
                    computation,
                    sender,
                    remove_computation_token,
                );
                channel
            }
        };

        let name = self.policy.name.clone();
        channel
            .unwrap_or_else(move |_cancelled| {
                let message = format!("{name} computation channel dropped");
                Err(Arc::new(
                    std::io::Error::new(std::io::ErrorKind::Interrupted, message).into(),
                ))
            })
            .boxed()
    }

    /// Runs the computation as a separate task and settles the entry of `generation` with its
    /// result.
    fn spawn_computation<Fut>(
        self: &Arc<Self>,
        key: CacheKey,
        generation: u64,
        computation: Fut,
        sender: oneshot::Sender<ComputationResult<T, E>>,
        remove_computation_token: CallOnDrop,
    ) where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.policy.name.clone();
        StatCounters::bump(&self.stats.dispatches);
        metric!(counter("caches.computation") += 1, "cache" => &name);
        tracing::debug!(cache = %name, key = %key, "Dispatching computation");

        let store = Arc::clone(self);
        let task = async move {
            let start = Instant::now();
            let result = match &store.policy.watchdog {
                Some(watchdog) => {
                    let watched = watchdog.watch(&key, computation);
                    let threshold = watchdog.threshold();
                    let output = watched.await;
                    if start.elapsed() > threshold {
                        StatCounters::bump(&store.stats.slow);
                        metric!(counter("caches.computation.slow") += 1, "cache" => &name);
                    }
                    output
                }
                None => computation.await,
            };
            metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => &name);

            let result = match result {
                Ok(ok) => Ok(Arc::new(ok)),
                Err(err) => Err(Arc::new(err)),
            };
            // Settle the entry first.  This ensures that callers either get a channel that
            // will receive data, or they find the settled value.
            store.settle(&key, generation, &result);
            remove_computation_token.disarm();
            sender.send(result).ok();
        };

        tokio::spawn(task);
    }

    /// Moves the entry of `generation` out of the pending state.
    fn settle(&self, key: &CacheKey, generation: u64, result: &ComputationResult<T, E>) {
        let name = self.name();
        if result.is_err() {
            StatCounters::bump(&self.stats.failures);
            metric!(counter("caches.computation.failed") += 1, "cache" => name);
        }

        let mut entries = self.entries.lock().unwrap();
        let current = entries.get(key).map(|entry| entry.generation);
        if current != Some(generation) {
            drop(entries);
            if result.is_ok() {
                StatCounters::bump(&self.stats.discarded);
                metric!(counter("caches.computation.discarded") += 1, "cache" => name);
            }
            tracing::debug!(cache = name, key = %key, "Discarding result of cleared computation");
            return;
        }

        match result {
            Ok(value) => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.info.touch();
                    entry.state = EntryState::Settled(Arc::clone(value));
                }
                metric!(gauge("caches.entries") = entries.len() as u64, "cache" => name);
                tracing::debug!(cache = name, key = %key, "Computation settled");
            }
            Err(_) => {
                entries.remove(key);
                tracing::debug!(cache = name, key = %key, "Computation failed, not caching");
            }
        }
    }

    /// Removes the entry for `key` if it is still pending on the dispatch `generation`.
    fn remove_pending(&self, key: &CacheKey, generation: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(CacheEntry {
            generation: current,
            state: EntryState::Pending(_),
            ..
        }) = entries.get(key)
        {
            if *current == generation {
                entries.remove(key);
                tracing::debug!(cache = self.name(), key = %key, "Computation dropped before settling");
            }
        }
    }
}

impl<T, E> CacheStore<T, E> {
    /// Removes all entries, pending ones included.
    ///
    /// Dispatches that are still running are not cancelled, but their result will not be
    /// cached.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        let count = entries.len();
        entries.clear();
        drop(entries);
        metric!(gauge("caches.entries") = 0u64, "cache" => &self.policy.name);
        tracing::debug!(cache = %self.policy.name, count, "Cleared cache");
    }

    /// The number of pending and settled entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
