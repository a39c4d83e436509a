//! Generic keyed read/write-through cache.
//!
//! Same entry lifecycle as the query cache (TTL, refresh-ahead, serve-stale,
//! single-flight) over an arbitrary key, backed by pluggable callbacks:
//! a [`CacheLoader`] for reads, a [`CacheWriter`] and [`CacheDeleter`] for
//! write-through. Loads run on a [`TaskSpawner`]; a miss blocks for at most
//! the policy's `blocking_timeout` and otherwise lets the load finish in the
//! background.

use crate::cache::{CacheEntry, CachePolicy, Clock, Invalidate, MonotonicClock, TouchedTables, evict_excess};
use crate::error::{ExecutionError, Result};
use crate::storage::engine::panic_message;
use crate::storage::pending::Pending;
use crate::storage::tx::in_transaction;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tracing::{debug, trace, warn};

/// Reads a value for a key. `Ok(None)` means the key does not exist.
pub trait CacheLoader<K, V>: Send + Sync {
    /// # Errors
    ///
    /// Any error is delivered to the callers waiting on this load.
    fn load(&self, key: &K) -> Result<Option<V>>;
}

impl<K, V, F> CacheLoader<K, V> for F
where
    F: Fn(&K) -> Result<Option<V>> + Send + Sync,
{
    fn load(&self, key: &K) -> Result<Option<V>> {
        self(key)
    }
}

/// Persists a value written through the cache.
pub trait CacheWriter<K, V>: Send + Sync {
    /// # Errors
    ///
    /// Propagated to the caller of `put`.
    fn write(&self, key: &K, value: &V) -> Result<()>;
}

impl<K, V, F> CacheWriter<K, V> for F
where
    F: Fn(&K, &V) -> Result<()> + Send + Sync,
{
    fn write(&self, key: &K, value: &V) -> Result<()> {
        self(key, value)
    }
}

/// Removes a key from the backing store.
pub trait CacheDeleter<K>: Send + Sync {
    /// # Errors
    ///
    /// Propagated to the caller of `delete`.
    fn delete(&self, key: &K) -> Result<()>;
}

impl<K, F> CacheDeleter<K> for F
where
    F: Fn(&K) -> Result<()> + Send + Sync,
{
    fn delete(&self, key: &K) -> Result<()> {
        self(key)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriter;

impl<K, V> CacheWriter<K, V> for NoopWriter {
    fn write(&self, _: &K, _: &V) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDeleter;

impl<K> CacheDeleter<K> for NoopDeleter {
    fn delete(&self, _: &K) -> Result<()> {
        Ok(())
    }
}

/// Where background loads and async writes run.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs each task on a fresh thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl TaskSpawner for ThreadSpawner {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        let slot = Arc::new(Mutex::new(Some(task)));
        let runner = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("tickdb-cache-load".to_string())
            .spawn(move || {
                let task = runner.lock().take();
                if let Some(task) = task {
                    task();
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not spawn cache thread; running task inline");
            let task = slot.lock().take();
            if let Some(task) = task {
                task();
            }
        }
    }
}

type Slot<V> = CacheEntry<V, Pending<Option<V>>>;

struct Inner<K, V> {
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    loader: Arc<dyn CacheLoader<K, V>>,
    writer: Arc<dyn CacheWriter<K, V>>,
    deleter: Arc<dyn CacheDeleter<K>>,
    spawner: Arc<dyn TaskSpawner>,
    depends_on: BTreeSet<String>,
    entries: DashMap<K, Slot<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    refreshes: AtomicU64,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn evict(&self, keep: &K) {
        let evicted = evict_excess(&self.entries, self.policy.max_size, keep);
        if evicted > 0 {
            trace!(evicted, "keyed cache over capacity");
        }
    }

    /// Apply the outcome of the load identified by `load_id`, unless the slot
    /// was written, invalidated or re-claimed in the meantime. Values read
    /// inside an open transaction are handed to the waiters but not cached.
    fn apply_loaded(&self, key: &K, load_id: u64, result: &Result<Option<V>>) {
        match result {
            Ok(Some(value)) if !in_transaction() => {
                let now = self.clock.now();
                let installed = match self.entries.get_mut(key) {
                    Some(mut slot) if slot.is_loaded_by(load_id) => {
                        *slot = Slot::fresh(value.clone(), now);
                        true
                    }
                    _ => false,
                };
                if installed {
                    self.evict(key);
                }
            }
            Ok(None) => {
                self.entries.remove_if(key, |_, slot| slot.is_loaded_by(load_id));
            }
            Ok(Some(_)) => self.abandon_load(key, load_id),
            Err(err) => {
                debug!(error = %err, "cache load failed; keeping previous entry");
                self.abandon_load(key, load_id);
            }
        }
    }

    fn abandon_load(&self, key: &K, load_id: u64) {
        self.entries
            .remove_if(key, |_, slot| slot.is_loaded_by(load_id) && slot.value.is_none());
        if let Some(mut slot) = self.entries.get_mut(key) {
            if slot.is_loaded_by(load_id) {
                *slot = slot.without_loading();
            }
        }
    }
}

/// Keyed read/write-through cache.
pub struct KeyedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for KeyedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Read-only cache loading on fresh threads.
    pub fn new(policy: CachePolicy, loader: impl CacheLoader<K, V> + 'static) -> Self {
        Self::builder(policy, loader).build()
    }

    pub fn builder(policy: CachePolicy, loader: impl CacheLoader<K, V> + 'static) -> KeyedCacheBuilder<K, V> {
        KeyedCacheBuilder {
            policy,
            loader: Arc::new(loader),
            writer: Arc::new(NoopWriter),
            deleter: Arc::new(NoopDeleter),
            spawner: Arc::new(ThreadSpawner),
            clock: Arc::new(MonotonicClock),
            depends_on: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// The cached or freshly loaded value, or `default` when the key does not
    /// exist or its load did not finish within the blocking timeout.
    ///
    /// # Errors
    ///
    /// Returns the loader's error if the load this call waited on failed.
    pub fn get(&self, key: &K, default: V) -> Result<V> {
        Ok(self.get_optional(key)?.unwrap_or(default))
    }

    /// # Errors
    ///
    /// Returns the loader's error if the load this call waited on failed.
    pub fn get_optional(&self, key: &K) -> Result<Option<V>> {
        let policy = &self.inner.policy;
        let now = self.inner.clock.now();
        let cached = self.inner.entries.get(key).map(|slot| slot.clone());
        if let Some(slot) = cached {
            if let Some(value) = slot.value.clone() {
                if !slot.is_expired(now, policy.ttl) {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    if slot.needs_refresh(now, policy.refresh_after) {
                        self.refresh(key);
                    }
                    return Ok(Some(value));
                }
                if policy.serve_stale_while_refreshing {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    self.refresh(key);
                    return Ok(Some(value));
                }
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.load_on_miss(key)
    }

    fn load_on_miss(&self, key: &K) -> Result<Option<V>> {
        let pending = Pending::<Option<V>>::new();
        let now = self.inner.clock.now();
        let (waiter, start) = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().loading.clone() {
                Some(loading) if !loading.is_done() => (loading, false),
                _ => {
                    // A load may have landed since the caller looked.
                    let slot = occupied.get();
                    if let Some(value) = slot.value.clone() {
                        if !slot.is_expired(now, self.inner.policy.ttl) {
                            return Ok(Some(value));
                        }
                    }
                    let next = slot.with_loading(pending.clone());
                    occupied.insert(next);
                    (pending.clone(), true)
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::placeholder(None, now).with_loading(pending.clone()));
                (pending.clone(), true)
            }
        };
        if start {
            self.start_load(key.clone(), pending);
        }

        let timeout = self.inner.policy.blocking_timeout;
        if timeout.is_zero() {
            return Ok(None);
        }
        match waiter.wait_timeout(timeout) {
            Some(result) => result,
            None => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn refresh(&self, key: &K) {
        let pending = Pending::<Option<V>>::new();
        let claimed = match self.inner.entries.get_mut(key) {
            Some(mut slot) if !slot.is_loading() => {
                *slot = slot.with_loading(pending.clone());
                true
            }
            _ => false,
        };
        if claimed {
            self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
            self.start_load(key.clone(), pending);
        }
    }

    fn start_load(&self, key: K, pending: Pending<Option<V>>) {
        let inner = Arc::clone(&self.inner);
        self.inner.spawner.spawn(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| inner.loader.load(&key)))
                .unwrap_or_else(|payload| {
                    Err(ExecutionError::Panicked(panic_message(payload.as_ref())).into())
                });
            inner.apply_loaded(&key, pending.id(), &result);
            pending.complete(result);
        }));
    }

    /// Write-through: the cache is updated first, then the writer runs. A
    /// failing writer leaves the new value cached.
    ///
    /// # Errors
    ///
    /// Returns the writer's error.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        let now = self.inner.clock.now();
        self.inner
            .entries
            .insert(key.clone(), Slot::fresh(value.clone(), now));
        self.inner.evict(&key);
        self.inner.writer.write(&key, &value)
    }

    /// [`put`](Self::put) on the spawner.
    pub fn put_async(&self, key: K, value: V) -> Pending<()> {
        let cache = self.clone();
        self.run_async(move || cache.put(key, value))
    }

    /// Drop the cached entry without touching the backing store.
    pub fn invalidate(&self, key: &K) {
        self.inner.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.inner.entries.clear();
    }

    /// Remove the cached entry, then run the deleter.
    ///
    /// # Errors
    ///
    /// Returns the deleter's error; the entry stays removed.
    pub fn delete(&self, key: &K) -> Result<()> {
        self.inner.entries.remove(key);
        self.inner.deleter.delete(key)
    }

    /// [`delete`](Self::delete) on the spawner.
    pub fn delete_async(&self, key: K) -> Pending<()> {
        let cache = self.clone();
        self.run_async(move || cache.delete(&key))
    }

    fn run_async<F>(&self, work: F) -> Pending<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let pending = Pending::new();
        let done = pending.clone();
        self.inner.spawner.spawn(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
                Err(ExecutionError::Panicked(panic_message(payload.as_ref())).into())
            });
            done.complete(result);
        }));
        pending
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn timeout_count(&self) -> u64 {
        self.inner.timeouts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Tables whose committed writes clear this cache.
    pub fn depends_on(&self) -> impl Iterator<Item = &str> {
        self.inner.depends_on.iter().map(String::as_str)
    }

    /// Drop every entry. Loads still in flight complete for their waiters
    /// but are not cached.
    pub fn close(&self) {
        self.invalidate_all();
    }
}

impl<K, V> Invalidate for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn invalidate_touched(&self, touched: &TouchedTables) {
        if touched.clears_all() || self.inner.depends_on.iter().any(|t| touched.contains(t)) {
            self.invalidate_all();
        }
    }
}

impl<K, V> fmt::Debug for KeyedCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("policy", &self.inner.policy)
            .field("entries", &self.inner.entries.len())
            .field("depends_on", &self.inner.depends_on)
            .finish_non_exhaustive()
    }
}

/// Configures a [`KeyedCache`].
pub struct KeyedCacheBuilder<K, V> {
    policy: CachePolicy,
    loader: Arc<dyn CacheLoader<K, V>>,
    writer: Arc<dyn CacheWriter<K, V>>,
    deleter: Arc<dyn CacheDeleter<K>>,
    spawner: Arc<dyn TaskSpawner>,
    clock: Arc<dyn Clock>,
    depends_on: BTreeSet<String>,
}

impl<K, V> KeyedCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn writer(mut self, writer: impl CacheWriter<K, V> + 'static) -> Self {
        self.writer = Arc::new(writer);
        self
    }

    #[must_use]
    pub fn deleter(mut self, deleter: impl CacheDeleter<K> + 'static) -> Self {
        self.deleter = Arc::new(deleter);
        self
    }

    #[must_use]
    pub fn spawner(mut self, spawner: impl TaskSpawner + 'static) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Clear the cache whenever a committed write touches `table`.
    #[must_use]
    pub fn depends_on(mut self, table: &str) -> Self {
        self.depends_on.insert(table.to_lowercase());
        self
    }

    #[must_use]
    pub fn build(self) -> KeyedCache<K, V> {
        KeyedCache {
            inner: Arc::new(Inner {
                policy: self.policy,
                clock: self.clock,
                loader: self.loader,
                writer: self.writer,
                deleter: self.deleter,
                spawner: self.spawner,
                depends_on: self.depends_on,
                entries: DashMap::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
            }),
        }
    }
}
