//! Keyed caches backed by a single-row query.
//!
//! The loader runs `sql` with parameters derived from the key and caches the
//! first row. Loads run on the store's own worker, and the cache is
//! registered with the store so committed writes to the queried tables clear
//! it.

use crate::cache::keyed::KeyedCache;
use crate::cache::CachePolicy;
use crate::cache::query::normalize_table_name;
use crate::error::Result;
use crate::storage::guard::BlockingOptions;
use crate::storage::param::Param;
use crate::storage::row::RowMapper;
use crate::storage::Database;
use once_cell::sync::Lazy;
use regex::Regex;
use std::hash::Hash;
use std::sync::Arc;

/// Maps a cache key to the statement parameters of its lookup query.
pub trait KeyParams<K>: Send + Sync {
    fn params_for(&self, key: &K) -> Vec<Param>;
}

impl<K, F> KeyParams<K> for F
where
    F: Fn(&K) -> Vec<Param> + Send + Sync,
{
    fn params_for(&self, key: &K) -> Vec<Param> {
        self(key)
    }
}

static SOURCE_TABLES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:from|join)\s+([\w."`\[\]]+)"#).expect("source table pattern is valid")
});

/// Tables a read statement pulls from, lowercased.
fn source_tables(sql: &str) -> Vec<String> {
    SOURCE_TABLES
        .captures_iter(sql)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| normalize_table_name(m.as_str()))
        .map(|name| name.to_lowercase())
        .collect()
}

/// Cache over `sql` run with the store's unguarded semantics.
pub fn query_one_cache<K, V>(
    db: &Database,
    policy: CachePolicy,
    sql: &str,
    mapper: RowMapper<V>,
    key_params: impl KeyParams<K> + 'static,
) -> Arc<KeyedCache<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    build(db, policy, sql, mapper, key_params, None)
}

/// Cache whose loads are themselves guarded by `options`. A load that times
/// out under fail-open behaves like a missing row.
pub fn query_one_blocking_cache<K, V>(
    db: &Database,
    policy: CachePolicy,
    sql: &str,
    options: BlockingOptions,
    mapper: RowMapper<V>,
    key_params: impl KeyParams<K> + 'static,
) -> Arc<KeyedCache<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    build(db, policy, sql, mapper, key_params, Some(options))
}

fn build<K, V>(
    db: &Database,
    policy: CachePolicy,
    sql: &str,
    mapper: RowMapper<V>,
    key_params: impl KeyParams<K> + 'static,
    options: Option<BlockingOptions>,
) -> Arc<KeyedCache<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let source = db.clone();
    let statement = sql.to_string();
    let loader = move |key: &K| -> Result<Option<V>> {
        let params = key_params.params_for(key);
        match &options {
            Some(options) => source.query_one_blocking(&statement, &params, &mapper, options),
            None => source.query_one_uncached(&statement, &params, &mapper),
        }
    };

    let mut builder = KeyedCache::builder(policy, loader).spawner(db.clone());
    for table in source_tables(sql) {
        builder = builder.depends_on(&table);
    }
    let cache = Arc::new(builder.build());
    db.register_invalidation(&cache);
    cache
}
