//! A byte-bounded LRU (least recently used) cache with single-flight loading.
//!
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};

use bytes::Bytes;
use futures::{
    channel::oneshot::{channel, Sender},
    future::BoxFuture,
};
use parking_lot::Mutex;
use tracing::trace;

use crate::errors::Result;

/// A cache of immutable objects.
///
/// Values must implement `Cacheable`, which self reports size, intended to be the number of bytes
/// (more or less) an object takes up in memory.
///
/// When a `limit` is given and an insertion pushes the total size of cached objects over it,
/// objects are evicted, least recently used first, until the total is back under the limit. A cache
/// without a limit never evicts anything.
///
/// When interrogating the cache with `get`, a `load` function is passed in that is used to load
/// the object from an underlying store on a cache miss. Concurrent requests for the same missing
/// object share a single load: the first caller performs it and everybody else waits for its
/// outcome, success or failure. A failed load is not remembered, so the next request tries again.
///
/// Keys are assumed to identify immutable content, so nothing special needs to be done for
/// invalidation.
///
pub(crate) struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    entries: Mutex<Entries<K, V>>,

    /// Loads currently in flight
    loaders: Mutex<HashMap<K, Arc<Loader<V>>>>,
}

/// A trait for objects that can be cached
///
pub(crate) trait Cacheable: Sized {
    /// Approximate number of bytes this object occupies
    fn size(&self) -> u64;
}

impl Cacheable for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }
}

struct Entries<K, V> {
    limit: Option<u64>,
    size: u64,

    /// Monotonic counter used to order entries by recency of use
    tick: u64,
    map: HashMap<K, Entry<V>>,

    /// Keys ordered from least to most recently used
    recency: BTreeMap<u64, K>,
}

struct Entry<V> {
    object: Arc<V>,
    size: u64,
    tick: u64,
}

/// Synchronizes one load among every task that wants its result.
struct Loader<V> {
    state: Mutex<LoaderState<V>>,
}

struct LoaderState<V> {
    outcome: Option<Result<Arc<V>>>,
    waiters: Vec<Sender<Result<Arc<V>>>>,
}

enum Role<V> {
    Load(Arc<Loader<V>>),
    Wait(Arc<Loader<V>>),
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    /// Cache that evicts least recently used objects to stay under `limit` bytes.
    ///
    pub(crate) fn new(limit: u64) -> Self {
        Self::with_limit(Some(limit))
    }

    /// Cache that keeps everything it loads.
    ///
    pub(crate) fn unbounded() -> Self {
        Self::with_limit(None)
    }

    fn with_limit(limit: Option<u64>) -> Self {
        Self {
            entries: Mutex::new(Entries {
                limit,
                size: 0,
                tick: 0,
                map: HashMap::new(),
                recency: BTreeMap::new(),
            }),
            loaders: Mutex::new(HashMap::new()),
        }
    }

    /// Get an object by key, loading it with `load` on a miss.
    ///
    pub(crate) async fn get<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: Fn(K) -> BoxFuture<'static, Result<V>>,
    {
        if let Some(object) = self.entries.lock().lookup(key) {
            return Ok(object);
        }

        loop {
            let role = {
                let mut loaders = self.loaders.lock();

                // Check again now that no load for this key can finish behind our back
                if let Some(object) = self.entries.lock().lookup(key) {
                    return Ok(object);
                }

                match loaders.get(key) {
                    Some(loader) => Role::Wait(Arc::clone(loader)),
                    None => {
                        let loader = Arc::new(Loader::new());
                        loaders.insert(key.clone(), Arc::clone(&loader));

                        Role::Load(loader)
                    }
                }
            };

            match role {
                Role::Load(loader) => return self.load(key, loader, &load).await,
                Role::Wait(loader) => {
                    trace!(?key, "waiting on in-flight load");
                    if let Some(outcome) = loader.wait().await {
                        return outcome;
                    }

                    // The loading task was dropped before finishing. Start over.
                    trace!(?key, "in-flight load abandoned, retrying");
                }
            }
        }
    }

    /// Whether an object is currently cached, without touching its recency.
    ///
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.lock().map.contains_key(key)
    }

    /// Number of cached objects
    ///
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    async fn load<L>(&self, key: &K, loader: Arc<Loader<V>>, load: &L) -> Result<Arc<V>>
    where
        L: Fn(K) -> BoxFuture<'static, Result<V>>,
    {
        let mut guard = LoadGuard {
            loaders: &self.loaders,
            key,
            loader,
            finished: false,
        };

        let outcome = load(key.clone()).await.map(Arc::new);
        if let Ok(object) = &outcome {
            self.entries.lock().insert(key.clone(), object);
        }
        guard.finish(outcome.clone());

        outcome
    }
}

/// Makes sure a load is unregistered and its waiters released, even if the loading future is
/// dropped part way through.
struct LoadGuard<'a, K, V>
where
    K: Eq + Hash,
{
    loaders: &'a Mutex<HashMap<K, Arc<Loader<V>>>>,
    key: &'a K,
    loader: Arc<Loader<V>>,
    finished: bool,
}

impl<'a, K, V> LoadGuard<'a, K, V>
where
    K: Eq + Hash,
{
    fn finish(&mut self, outcome: Result<Arc<V>>) {
        self.loaders.lock().remove(self.key);
        self.loader.finish(outcome);
        self.finished = true;
    }
}

impl<'a, K, V> Drop for LoadGuard<'a, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if !self.finished {
            self.loaders.lock().remove(self.key);
            self.loader.abandon();
        }
    }
}

impl<V> Loader<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(LoaderState {
                outcome: None,
                waiters: vec![],
            }),
        }
    }

    /// Hand the outcome of the load to every waiting task.
    ///
    fn finish(&self, outcome: Result<Arc<V>>) {
        let mut state = self.state.lock();
        for waiter in state.waiters.drain(..) {
            // A waiter that went away doesn't need telling
            let _ = waiter.send(outcome.clone());
        }
        state.outcome = Some(outcome);
    }

    /// Release waiting tasks without an outcome.
    ///
    fn abandon(&self) {
        self.state.lock().waiters.clear();
    }

    /// Wait for the outcome of the load. `None` if the load was abandoned.
    ///
    async fn wait(&self) -> Option<Result<Arc<V>>> {
        let receive = {
            let mut state = self.state.lock();
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let (send, receive) = channel();
            state.waiters.push(send);

            receive
        };

        receive.await.ok()
    }
}

impl<K, V> Entries<K, V>
where
    K: Eq + Hash + Clone,
    V: Cacheable,
{
    /// Return a cached object, marking it most recently used.
    ///
    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.map.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());

        Some(Arc::clone(&entry.object))
    }

    /// Add a new object, evicting least recently used objects if over the limit.
    ///
    fn insert(&mut self, key: K, object: &Arc<V>) {
        self.tick += 1;
        let entry = Entry {
            object: Arc::clone(object),
            size: object.size(),
            tick: self.tick,
        };
        self.size += entry.size;
        self.recency.insert(entry.tick, key.clone());
        if let Some(old) = self.map.insert(key, entry) {
            self.recency.remove(&old.tick);
            self.size -= old.size;
        }

        if let Some(limit) = self.limit {
            while self.size > limit {
                let Some((_, key)) = self.recency.pop_first() else {
                    break;
                };
                if let Some(evicted) = self.map.remove(&key) {
                    self.size -= evicted.size;
                }
            }
        }
    }

    #[cfg(test)]
    fn keys_by_recency(&self) -> Vec<K> {
        self.recency.values().rev().cloned().collect()
    }
}
