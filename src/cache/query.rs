//! Read-through query cache.
//!
//! Results are cached per (statement, parameters, decoder). A hit past
//! `refresh_after` schedules a background reload on the storage worker; an
//! expired hit is either served stale while reloading or treated as a miss.
//! Concurrent misses on one key share a single load.
//!
//! Invalidation is by table name: a write to `users` drops every entry whose
//! statement mentions `users` as a whole word.

use crate::cache::{CacheEntry, CachePolicy, Clock, Invalidate, MonotonicClock, TouchedTables, evict_excess};
use crate::error::Result;
use crate::storage::engine::StorageEngine;
use crate::storage::param::Param;
use crate::storage::pending::{InFlight, Pending};
use crate::storage::query_rows;
use crate::storage::row::RowMapper;
use crate::storage::tx::in_transaction;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

const TABLE_NAME: &str = r#"([\w."`\[\]]+)"#;

static WRITE_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^(?:insert(?:\s+or\s+\w+)?\s+into|replace\s+into|update(?:\s+or\s+\w+)?|delete\s+from)\s+{TABLE_NAME}"
    ))
    .expect("write target pattern is valid")
});
static WITH_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^with\b").expect("with prefix pattern is valid"));
static WRITE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:insert|replace|update|delete)\b").expect("write keyword pattern is valid")
});

/// Target table of an `INSERT`, `UPDATE` or `DELETE` statement, without
/// quoting or schema prefix. Only the statement's leading clause counts,
/// after any `WITH` prefix. `None` for anything else (DDL, pragmas,
/// unrecognized syntax).
#[must_use]
pub fn extract_table_name(sql: &str) -> Option<String> {
    let statement = skip_with_clause(sql.trim());
    let captured = WRITE_TARGET.captures(statement)?.get(1)?;
    normalize_table_name(captured.as_str())
}

/// The statement from its first top-level write keyword on, if it opens
/// with common table expressions.
fn skip_with_clause(sql: &str) -> &str {
    if !WITH_PREFIX.is_match(sql) {
        return sql;
    }
    let mut depth = 0_usize;
    let mut quote: Option<char> = None;
    let mut previous = ' ';
    for (idx, ch) in sql.char_indices() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
        } else {
            match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if depth == 0
                    && !(previous.is_alphanumeric() || previous == '_')
                    && WRITE_KEYWORD.is_match(&sql[idx..]) =>
                {
                    return &sql[idx..];
                }
                _ => {}
            }
        }
        previous = ch;
    }
    sql
}

/// Strip quoting and any schema prefix from a table reference.
pub(crate) fn normalize_table_name(raw: &str) -> Option<String> {
    let name = raw
        .rsplit('.')
        .next()?
        .trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'));
    if name.is_empty() { None } else { Some(name.to_string()) }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    sql: Arc<str>,
    sql_lower: Arc<str>,
    params: Arc<[Param]>,
    mapper_id: u64,
}

impl QueryKey {
    fn new(sql: &str, params: &[Param], mapper_id: u64) -> Self {
        Self {
            sql: Arc::from(sql),
            sql_lower: Arc::from(sql.to_lowercase()),
            params: Arc::from(params),
            mapper_id,
        }
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryKey")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .field("mapper", &self.mapper_id)
            .finish()
    }
}

/// Everything needed to run the statement behind a key.
struct LoadRequest<T> {
    sql: Arc<str>,
    params: Arc<[Param]>,
    mapper: RowMapper<T>,
}

impl<T> LoadRequest<T> {
    fn for_key(key: &QueryKey, mapper: &RowMapper<T>) -> Self {
        Self {
            sql: Arc::clone(&key.sql),
            params: Arc::clone(&key.params),
            mapper: mapper.clone(),
        }
    }

    fn run(&self, conn: &Connection) -> Result<Vec<T>> {
        query_rows(conn, &self.sql, &self.params, &self.mapper)
    }
}

type Erased = Arc<dyn Any + Send + Sync>;
type Slot = CacheEntry<Erased, Arc<dyn InFlight>>;

/// Counters for one query cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub entries: usize,
}

struct Inner {
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    entries: DashMap<QueryKey, Slot>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
}

impl Inner {
    /// Apply the outcome of the load identified by `load_id`. A slot that was
    /// invalidated or claimed by a newer load in the meantime is left alone,
    /// and nothing read inside an open transaction is installed.
    fn finish_load<T>(&self, key: &QueryKey, load_id: u64, result: &Result<Vec<T>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        match result {
            Ok(rows) if !in_transaction() => {
                let now = self.clock.now();
                let installed = match self.entries.get_mut(key) {
                    Some(mut slot) if slot.is_loaded_by(load_id) => {
                        let value: Erased = Arc::new(rows.clone());
                        *slot = Slot::fresh(value, now);
                        true
                    }
                    _ => false,
                };
                if installed {
                    let evicted = evict_excess(&self.entries, self.policy.max_size, key);
                    if evicted > 0 {
                        trace!(evicted, "query cache over capacity");
                    }
                }
            }
            Ok(_) => {
                trace!(sql = %key.sql, "load ran inside a transaction; not caching");
                self.abandon_load(key, load_id);
            }
            Err(err) => {
                debug!(sql = %key.sql, error = %err, "query load failed; keeping previous entry");
                self.abandon_load(key, load_id);
            }
        }
    }

    /// Release the slot claimed by `load_id`, keeping any previous value.
    fn abandon_load(&self, key: &QueryKey, load_id: u64) {
        self.entries
            .remove_if(key, |_, slot| slot.is_loaded_by(load_id) && slot.value.is_none());
        if let Some(mut slot) = self.entries.get_mut(key) {
            if slot.is_loaded_by(load_id) {
                *slot = slot.without_loading();
            }
        }
    }
}

/// Read-through cache of decoded query results.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self::with_clock(policy, Arc::new(MonotonicClock))
    }

    #[must_use]
    pub fn with_clock(policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                clock,
                entries: DashMap::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// A `max_size` of zero turns the cache into a pass-through.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.policy.max_size > 0
    }

    /// Resolve a query through the cache. Hits complete immediately; misses
    /// complete when the (possibly shared) load finishes on `engine`.
    pub(crate) fn lookup<T>(
        &self,
        engine: &StorageEngine,
        sql: &str,
        params: &[Param],
        mapper: &RowMapper<T>,
    ) -> Pending<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = QueryKey::new(sql, params, mapper.id());
        // Reads inside a transaction see its uncommitted writes.
        if !self.is_enabled() || in_transaction() {
            let request = LoadRequest::for_key(&key, mapper);
            return engine.submit_async(move |conn| request.run(conn));
        }

        let policy = &self.inner.policy;
        let now = self.inner.clock.now();
        let cached = self.inner.entries.get(&key).map(|slot| slot.clone());
        if let Some(slot) = cached {
            if let Some(rows) = cached_rows::<T>(&slot) {
                if !slot.is_expired(now, policy.ttl) {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    if slot.needs_refresh(now, policy.refresh_after) {
                        self.refresh(engine, &key, mapper);
                    }
                    return Pending::ready(Ok(rows));
                }
                if policy.serve_stale_while_refreshing {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    self.refresh(engine, &key, mapper);
                    return Pending::ready(Ok(rows));
                }
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.load_on_miss(engine, key, mapper)
    }

    fn load_on_miss<T>(&self, engine: &StorageEngine, key: QueryKey, mapper: &RowMapper<T>) -> Pending<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let pending = Pending::<Vec<T>>::new();
        let marker: Arc<dyn InFlight> = Arc::new(pending.clone());
        let now = self.inner.clock.now();
        let in_flight = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_loading() {
                    occupied.get().loading.clone()
                } else {
                    // A load may have landed since the caller looked.
                    if !occupied.get().is_expired(now, self.inner.policy.ttl) {
                        if let Some(rows) = cached_rows::<T>(occupied.get()) {
                            return Pending::ready(Ok(rows));
                        }
                    }
                    let next = occupied.get().with_loading(marker);
                    occupied.insert(next);
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::placeholder(None, now).with_loading(marker));
                None
            }
        };

        if let Some(loading) = in_flight {
            if let Some(shared) = loading.as_any().downcast_ref::<Pending<Vec<T>>>() {
                // The shared load is queued behind us when we are the worker.
                if !engine.on_worker() || shared.is_done() {
                    return shared.detached();
                }
            }
            let request = LoadRequest::for_key(&key, mapper);
            return engine.submit_async(move |conn| request.run(conn));
        }

        self.start_load(engine, key, pending.clone(), mapper);
        pending.detached()
    }

    fn refresh<T>(&self, engine: &StorageEngine, key: &QueryKey, mapper: &RowMapper<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let pending = Pending::<Vec<T>>::new();
        let claimed = match self.inner.entries.get_mut(key) {
            Some(mut slot) if !slot.is_loading() => {
                let marker: Arc<dyn InFlight> = Arc::new(pending.clone());
                *slot = slot.with_loading(marker);
                true
            }
            _ => false,
        };
        if !claimed {
            return;
        }
        self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
        trace!(sql = %key.sql, "refreshing cached query");
        self.start_load(engine, key.clone(), pending, mapper);
    }

    fn start_load<T>(&self, engine: &StorageEngine, key: QueryKey, pending: Pending<Vec<T>>, mapper: &RowMapper<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let request = LoadRequest::for_key(&key, mapper);
        let inner = Arc::clone(&self.inner);
        let load_id = pending.id();
        engine.dispatch_with(
            pending,
            move |conn| request.run(conn),
            move |result| inner.finish_load(&key, load_id, result),
        );
    }

    /// Drop every entry whose statement mentions `table` as a whole word,
    /// case-insensitively. A blank name clears the cache.
    pub fn invalidate_table(&self, table: &str) {
        let lower = table.trim().to_lowercase();
        if lower.is_empty() {
            self.invalidate_all();
            return;
        }
        let Ok(pattern) = Regex::new(&format!(r"\b{}\b", regex::escape(&lower))) else {
            self.invalidate_all();
            return;
        };
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|key, _| !pattern.is_match(&key.sql_lower));
        let removed = before.saturating_sub(self.inner.entries.len());
        if removed > 0 {
            debug!(table = %lower, removed, "invalidated cached queries");
        }
    }

    /// Invalidate for a mutating statement that has just been applied.
    pub fn invalidate_for_write(&self, sql: &str) {
        match extract_table_name(sql) {
            Some(table) => self.invalidate_table(&table),
            None => self.invalidate_all(),
        }
    }

    pub fn invalidate_all(&self) {
        self.inner.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            refreshes: self.inner.refreshes.load(Ordering::Relaxed),
            entries: self.inner.entries.len(),
        }
    }
}

impl Invalidate for QueryCache {
    fn invalidate_touched(&self, touched: &TouchedTables) {
        if touched.clears_all() {
            self.invalidate_all();
            return;
        }
        for table in touched.tables() {
            self.invalidate_table(table);
        }
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("policy", &self.inner.policy)
            .field("entries", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

fn cached_rows<T: Clone + 'static>(slot: &Slot) -> Option<Vec<T>> {
    slot.value.as_ref()?.downcast_ref::<Vec<T>>().cloned()
}
