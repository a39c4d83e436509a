//! The `Database` facade.
//!
//! Ties one [`StorageEngine`] to the blocking guard, the read-through query
//! cache and the set of caches that want to hear about committed writes.
//! Handles are cheap to clone; the worker shuts down with the last one.

use crate::cache::keyed::TaskSpawner;
use crate::cache::{Clock, Invalidate, MonotonicClock, QueryCache, QueryCacheStats, TouchedTables};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::storage::engine::{StorageEngine, StoreLocation};
use crate::storage::guard::{BlockingOptions, GuardedContext, run_guarded};
use crate::storage::param::Param;
use crate::storage::pending::Pending;
use crate::storage::row::RowMapper;
use crate::storage::tx::{self, Tx, run_transaction};
use crate::storage::{execute_statement, query_first, query_rows};
use parking_lot::RwLock;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Fans committed writes out to the query cache and registered listeners.
struct Invalidator {
    cache: QueryCache,
    listeners: RwLock<Vec<Weak<dyn Invalidate>>>,
}

impl Invalidator {
    fn after_write(&self, sql: &str) {
        let mut touched = TouchedTables::new();
        touched.record(sql);
        self.invalidate(&touched);
    }

    fn invalidate(&self, touched: &TouchedTables) {
        self.cache.invalidate_touched(touched);
        let live: Vec<Arc<dyn Invalidate>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.invalidate_touched(touched);
        }
    }
}

struct DatabaseInner {
    engine: StorageEngine,
    context: Arc<GuardedContext>,
    invalidator: Arc<Invalidator>,
    config: StoreConfig,
}

/// Handle to one embedded store.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (or create) the store at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the store
    /// cannot be opened.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::start(
            StoreLocation::File(path.to_path_buf()),
            config,
            Arc::new(GuardedContext::new()),
            Arc::new(MonotonicClock),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the worker cannot be started.
    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        Self::start(
            StoreLocation::Memory,
            config,
            Arc::new(GuardedContext::new()),
            Arc::new(MonotonicClock),
        )
    }

    /// Open with an explicit guarded context (shared between stores owned by
    /// the same host loop) and cache clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker cannot be started or the store cannot
    /// be opened.
    pub fn start(
        location: StoreLocation,
        config: StoreConfig,
        context: Arc<GuardedContext>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let engine = StorageEngine::start(location, config.connection_settings())?;
        let cache = QueryCache::with_clock(config.cache_policy(), clock);
        debug!(store = %engine.name(), cache_enabled = cache.is_enabled(), "database ready");
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                engine,
                context,
                invalidator: Arc::new(Invalidator {
                    cache,
                    listeners: RwLock::new(Vec::new()),
                }),
                config,
            }),
        })
    }

    // Unguarded calls: wait as long as it takes, from any thread.

    /// Execute a mutating statement and invalidate the cache entries for its
    /// target table. Inside a transaction, invalidation waits for the commit.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the statement fails.
    pub fn execute(&self, sql: &str, params: &[Param]) -> Result<usize> {
        self.execute_blocking(sql, params, &BlockingOptions::unguarded())
            .map(Option::unwrap_or_default)
    }

    /// Query through the read-through cache.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the load fails or a row cannot be decoded.
    pub fn query<T>(&self, sql: &str, params: &[Param], mapper: &RowMapper<T>) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.query_blocking(sql, params, mapper, &BlockingOptions::unguarded())
            .map(Option::unwrap_or_default)
    }

    /// First row of [`query`](Self::query).
    ///
    /// # Errors
    ///
    /// As for [`query`](Self::query).
    pub fn query_one<T>(&self, sql: &str, params: &[Param], mapper: &RowMapper<T>) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.query_one_blocking(sql, params, mapper, &BlockingOptions::unguarded())
    }

    // Guarded calls. `Ok(None)` means the call timed out and failed open.

    /// # Errors
    ///
    /// Returns `GuardedContextDisallowed` or `Timeout` per `options`, or an
    /// execution error if the statement fails.
    pub fn execute_blocking(
        &self,
        sql: &str,
        params: &[Param],
        options: &BlockingOptions,
    ) -> Result<Option<usize>> {
        run_guarded(&self.inner.context, "execute", options, || {
            Ok(self.execute_async(sql, params))
        })
    }

    /// # Errors
    ///
    /// Returns `GuardedContextDisallowed` or `Timeout` per `options`, or an
    /// execution error if the load fails.
    pub fn query_blocking<T>(
        &self,
        sql: &str,
        params: &[Param],
        mapper: &RowMapper<T>,
        options: &BlockingOptions,
    ) -> Result<Option<Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        run_guarded(&self.inner.context, "query", options, || {
            Ok(self.query_async(sql, params, mapper))
        })
    }

    /// # Errors
    ///
    /// As for [`query_blocking`](Self::query_blocking).
    pub fn query_one_blocking<T>(
        &self,
        sql: &str,
        params: &[Param],
        mapper: &RowMapper<T>,
        options: &BlockingOptions,
    ) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let rows = self.query_blocking(sql, params, mapper, options)?;
        Ok(rows.and_then(|rows| rows.into_iter().next()))
    }

    // Async calls: return immediately with a handle.

    /// Queue a statement. Cancelling the handle skips it if it has not
    /// started and interrupts it if it is running.
    pub fn execute_async(&self, sql: &str, params: &[Param]) -> Pending<usize> {
        let sql = sql.to_string();
        let params = params.to_vec();
        let invalidator = Arc::clone(&self.inner.invalidator);
        self.inner.engine.submit_async(move |conn| {
            let changed = execute_statement(conn, &sql, &params)?;
            if !tx::record_in_active(&sql) {
                invalidator.after_write(&sql);
            }
            Ok(changed)
        })
    }

    pub fn query_async<T>(&self, sql: &str, params: &[Param], mapper: &RowMapper<T>) -> Pending<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .invalidator
            .cache
            .lookup(&self.inner.engine, sql, params, mapper)
    }

    /// Query straight from the store, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the query fails.
    pub fn query_uncached<T>(&self, sql: &str, params: &[Param], mapper: &RowMapper<T>) -> Result<Vec<T>>
    where
        T: Send + 'static,
    {
        let sql = sql.to_string();
        let params = params.to_vec();
        let mapper = mapper.clone();
        self.inner
            .engine
            .submit(move |conn| query_rows(conn, &sql, &params, &mapper))
    }

    /// # Errors
    ///
    /// Returns an execution error if the query fails.
    pub fn query_one_uncached<T>(
        &self,
        sql: &str,
        params: &[Param],
        mapper: &RowMapper<T>,
    ) -> Result<Option<T>>
    where
        T: Send + 'static,
    {
        let sql = sql.to_string();
        let params = params.to_vec();
        let mapper = mapper.clone();
        self.inner
            .engine
            .submit(move |conn| query_first(conn, &sql, &params, &mapper))
    }

    /// Run `work` atomically. On success the transaction commits and then,
    /// only then, the caches drop entries for every table it wrote. On
    /// failure it rolls back and nothing is invalidated.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, or a storage error from begin/commit.
    pub fn transaction<T, W>(&self, work: W) -> Result<T>
    where
        W: FnOnce(&mut Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let invalidator = Arc::clone(&self.inner.invalidator);
        self.inner.engine.submit(move |conn| {
            run_transaction(conn, work, |touched| invalidator.invalidate(touched))
        })
    }

    pub fn transaction_async<T, W>(&self, work: W) -> Pending<T>
    where
        W: FnOnce(&mut Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let invalidator = Arc::clone(&self.inner.invalidator);
        self.inner.engine.submit_async(move |conn| {
            run_transaction(conn, work, |touched| invalidator.invalidate(touched))
        })
    }

    /// Persisted schema version.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the pragma cannot be read.
    pub fn schema_version(&self) -> Result<u32> {
        self.inner.engine.submit(|conn| {
            let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            Ok(u32::try_from(version).unwrap_or(0))
        })
    }

    pub fn invalidate_table(&self, table: &str) {
        let mut touched = TouchedTables::new();
        touched.touch(table);
        self.inner.invalidator.invalidate(&touched);
    }

    pub fn invalidate_all(&self) {
        let mut touched = TouchedTables::new();
        touched.mark_all();
        self.inner.invalidator.invalidate(&touched);
    }

    /// Have `listener` invalidated alongside the query cache. Held weakly;
    /// dropping the listener unregisters it.
    pub fn register_invalidation<L>(&self, listener: &Arc<L>)
    where
        L: Invalidate + 'static,
    {
        let listener: Arc<dyn Invalidate> = Arc::clone(listener) as Arc<dyn Invalidate>;
        self.inner
            .invalidator
            .listeners
            .write()
            .push(Arc::downgrade(&listener));
    }

    #[must_use]
    pub fn guarded_context(&self) -> &Arc<GuardedContext> {
        &self.inner.context
    }

    /// The guarded-call options derived from this store's configuration.
    #[must_use]
    pub fn guarded_options(&self) -> BlockingOptions {
        self.inner.config.guarded_options()
    }

    #[must_use]
    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.invalidator.cache
    }

    #[must_use]
    pub fn cache_stats(&self) -> QueryCacheStats {
        self.inner.invalidator.cache.stats()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn engine(&self) -> &StorageEngine {
        &self.inner.engine
    }

    /// Stop the worker after draining queued work. Later calls on any clone
    /// of this handle fail with `WorkerUnavailable`.
    pub fn close(&self) {
        self.inner.engine.close();
    }
}

/// Runs keyed-cache loads on this store's worker.
impl TaskSpawner for Database {
    fn spawn(&self, task: Box<dyn FnOnce() + Send>) {
        self.inner.engine.enqueue(Box::new(move |_| task()));
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("engine", &self.inner.engine)
            .field("cache", &self.inner.invalidator.cache)
            .finish_non_exhaustive()
    }
}
