//! Caching layer.
//!
//! Two caches share one entry model: the read-through [`QueryCache`] keyed by
//! statement, parameters and decoder, and the generic [`KeyedCache`] backed by
//! pluggable load/write/delete callbacks. Entries are replaced, never mutated
//! in place; staleness is derived from the entry's write time and the
//! policy's TTL, measured on a [`Clock`].

pub mod factory;
pub mod keyed;
pub mod query;

pub use keyed::{
    CacheDeleter, CacheLoader, CacheWriter, KeyedCache, KeyedCacheBuilder, NoopDeleter,
    NoopWriter, TaskSpawner, ThreadSpawner,
};
pub use query::{QueryCache, QueryCacheStats, extract_table_name};

use crate::storage::pending::InFlight;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Shared policy for every entry of one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Age at which an entry expires. Zero means entries never expire.
    pub ttl: Duration,
    /// Age at which a fresh hit triggers a background reload. Zero disables
    /// refresh-ahead.
    pub refresh_after: Duration,
    /// How long a keyed-cache miss may block waiting for its load. Zero
    /// means never block.
    pub blocking_timeout: Duration,
    pub serve_stale_while_refreshing: bool,
    /// Entry bound enforced after insertions. Zero disables caching for the
    /// query cache and disables the bound for keyed caches.
    pub max_size: usize,
}

impl CachePolicy {
    /// 30s TTL, refresh after 10s, block up to 15ms on a miss, serve stale,
    /// 50 000 entries.
    #[must_use]
    pub const fn blocking_first_defaults() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            refresh_after: Duration::from_secs(10),
            blocking_timeout: Duration::from_millis(15),
            serve_stale_while_refreshing: true,
            max_size: 50_000,
        }
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_refresh_after(mut self, refresh_after: Duration) -> Self {
        self.refresh_after = refresh_after;
        self
    }

    #[must_use]
    pub const fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_serve_stale(mut self, serve_stale: bool) -> Self {
        self.serve_stale_while_refreshing = serve_stale;
        self
    }

    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::blocking_first_defaults()
    }
}

/// One cache slot.
///
/// `value` is absent while the first load for a key is outstanding.
/// `loading` holds the in-flight load, if any; it is what later callers
/// coalesce on.
#[derive(Clone)]
pub(crate) struct CacheEntry<V, L> {
    pub(crate) value: Option<V>,
    pub(crate) written_at: Instant,
    pub(crate) loading: Option<L>,
}

impl<V: Clone, L: InFlight + Clone> CacheEntry<V, L> {
    pub(crate) const fn fresh(value: V, now: Instant) -> Self {
        Self {
            value: Some(value),
            written_at: now,
            loading: None,
        }
    }

    pub(crate) const fn placeholder(stale: Option<V>, written_at: Instant) -> Self {
        Self {
            value: stale,
            written_at,
            loading: None,
        }
    }

    pub(crate) fn with_loading(&self, loading: L) -> Self {
        Self {
            value: self.value.clone(),
            written_at: self.written_at,
            loading: Some(loading),
        }
    }

    pub(crate) fn without_loading(&self) -> Self {
        Self {
            value: self.value.clone(),
            written_at: self.written_at,
            loading: None,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        now.saturating_duration_since(self.written_at) >= ttl
    }

    /// Refresh-ahead is due once the entry's age reaches `refresh_after`.
    pub(crate) fn needs_refresh(&self, now: Instant, refresh_after: Duration) -> bool {
        !refresh_after.is_zero() && now.saturating_duration_since(self.written_at) >= refresh_after
    }

    pub(crate) fn is_loading(&self) -> bool {
        self.loading.as_ref().is_some_and(|l| !l.finished())
    }

    /// True when the slot's in-flight marker is the load identified by `id`.
    pub(crate) fn is_loaded_by(&self, id: u64) -> bool {
        self.loading.as_ref().is_some_and(|l| l.load_id() == id)
    }
}

/// Monotonic time source for cache ages.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Set the elapsed time since the clock was created. Never moves
    /// backwards.
    pub fn set(&self, elapsed: Duration) {
        let mut offset = self.offset.lock();
        if elapsed > *offset {
            *offset = elapsed;
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// Remove entries in map iteration order until at most `max_size` remain.
/// Returns the number of entries removed. Which entries go is unspecified,
/// except that `keep` and slots with a load in flight are never chosen.
pub(crate) fn evict_excess<K, V, L>(map: &DashMap<K, CacheEntry<V, L>>, max_size: usize, keep: &K) -> usize
where
    K: Eq + Hash + Clone,
    V: Clone,
    L: InFlight + Clone,
{
    if max_size == 0 {
        return 0;
    }
    let size = map.len();
    if size <= max_size {
        return 0;
    }
    let victims: Vec<K> = map
        .iter()
        .filter(|entry| entry.key() != keep && !entry.value().is_loading())
        .take(size - max_size)
        .map(|entry| entry.key().clone())
        .collect();
    victims
        .iter()
        .filter(|key| map.remove_if(*key, |_, slot| !slot.is_loading()).is_some())
        .count()
}

/// Tables written by a statement or a transaction, accumulated until the
/// point where the writes become visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedTables {
    tables: BTreeSet<String>,
    clear_all: bool,
}

impl TouchedTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the target of a mutating statement. Statements whose target
    /// cannot be determined mark everything as touched.
    pub fn record(&mut self, sql: &str) {
        match extract_table_name(sql) {
            Some(table) => {
                self.tables.insert(table.to_lowercase());
            }
            None => self.clear_all = true,
        }
    }

    pub fn touch(&mut self, table: &str) {
        self.tables.insert(table.to_lowercase());
    }

    pub const fn mark_all(&mut self) {
        self.clear_all = true;
    }

    pub fn merge(&mut self, other: Self) {
        self.tables.extend(other.tables);
        self.clear_all |= other.clear_all;
    }

    #[must_use]
    pub const fn clears_all(&self) -> bool {
        self.clear_all
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.clear_all && self.tables.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(&table.to_lowercase())
    }
}

/// Something that drops cached state when tables change.
pub trait Invalidate: Send + Sync {
    fn invalidate_touched(&self, touched: &TouchedTables);
}
