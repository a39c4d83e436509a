//! Configuration management for `tickdb`.
//!
//! Configuration sources and precedence (highest wins):
//! 1. CLI overrides
//! 2. Environment variables (`TICKDB_*`)
//! 3. YAML file (`tickdb.yaml` unless a path is given)
//! 4. Defaults
//!
//! Keys are flat. Nested YAML mappings flatten to dotted keys, and every key
//! is canonicalized so `cache.ttl`, `cache_ttl`, `CACHE_TTL` and `cacheTtl`
//! all name the same setting.

use crate::cache::CachePolicy;
use crate::error::{Result, StoreError};
use crate::storage::engine::ConnectionSettings;
use crate::storage::guard::{BlockingOptions, MainThreadPolicy, TimeoutBehavior};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILENAME: &str = "tickdb.yaml";

const ENV_PREFIX: &str = "TICKDB_";

const KNOWN_KEYS: &[&str] = &[
    "foreign-keys",
    "journal-mode",
    "synchronous",
    "busy-timeout-ms",
    "guarded-context-timeout",
    "main-thread-policy",
    "timeout-behavior",
    "slow-query-warn-threshold",
    "cache-ttl",
    "cache-refresh-after",
    "cache-serve-stale-while-refreshing",
    "cache-max-size",
];

/// One source of configuration values, keyed by canonical name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    pub values: HashMap<String, String>,
}

impl ConfigLayer {
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(canonical_key(key), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&canonical_key(key)).map(String::as_str)
    }

    /// Merge another layer on top of this one (higher precedence wins).
    pub fn merge_from(&mut self, other: &Self) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Merge multiple layers in precedence order (lowest to highest).
    #[must_use]
    pub fn merge_layers(layers: &[Self]) -> Self {
        let mut merged = Self::default();
        for layer in layers {
            merged.merge_from(layer);
        }
        merged
    }

    /// Build a layer from a YAML file path. Missing files return empty config.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// # Errors
    ///
    /// Returns an error if `contents` is not valid YAML.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
        let mut flat = HashMap::new();
        flatten_yaml(&value, "", &mut flat);

        let mut layer = Self::default();
        for (key, value) in flat {
            layer.set(&key, value);
        }
        Ok(layer)
    }

    /// Build a layer from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    /// Build a layer from `TICKDB_`-prefixed variables; others are ignored.
    #[must_use]
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut layer = Self::default();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layer.set(stripped, value);
            }
        }
        layer
    }

    /// Keys present in this layer that no setting reads.
    #[must_use]
    pub fn unknown_keys(&self) -> Vec<&str> {
        let mut unknown: Vec<&str> = self
            .values
            .keys()
            .map(String::as_str)
            .filter(|key| !KNOWN_KEYS.contains(key))
            .collect();
        unknown.sort_unstable();
        unknown
    }
}

/// CLI overrides for config loading (`--set KEY=VALUE`).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub values: Vec<(String, String)>,
}

impl CliOverrides {
    /// Parse one `KEY=VALUE` pair.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if there is no `=` or the key is empty.
    pub fn parse_pair(raw: &str) -> Result<(String, String)> {
        match raw.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(StoreError::Config(format!(
                "expected KEY=VALUE, got '{raw}'"
            ))),
        }
    }

    #[must_use]
    pub fn as_layer(&self) -> ConfigLayer {
        let mut layer = ConfigLayer::default();
        for (key, value) in &self.values {
            layer.set(key, value.clone());
        }
        layer
    }
}

/// Default config layer (lowest precedence).
#[must_use]
pub fn default_config_layer() -> ConfigLayer {
    let defaults = StoreConfig::default();
    let mut layer = ConfigLayer::default();
    layer.set("foreign-keys", defaults.foreign_keys.to_string());
    layer.set("journal-mode", defaults.journal_mode);
    layer.set("synchronous", defaults.synchronous);
    layer.set("busy-timeout-ms", defaults.busy_timeout.as_millis().to_string());
    layer
}

/// Load configuration with the standard precedence order.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub fn load_config(cli: &CliOverrides) -> Result<ConfigLayer> {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    if cli.config_path.is_some() && !path.exists() {
        return Err(StoreError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    Ok(ConfigLayer::merge_layers(&[
        default_config_layer(),
        ConfigLayer::from_yaml(&path)?,
        ConfigLayer::from_env(),
        cli.as_layer(),
    ]))
}

/// Resolved store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreConfig {
    pub foreign_keys: bool,
    pub journal_mode: String,
    pub synchronous: String,
    #[serde(serialize_with = "as_millis")]
    pub busy_timeout: Duration,
    /// Timeout for calls made from the guarded context.
    #[serde(serialize_with = "as_millis")]
    pub guarded_context_timeout: Duration,
    #[serde(serialize_with = "as_display")]
    pub main_thread_policy: MainThreadPolicy,
    #[serde(serialize_with = "as_display")]
    pub timeout_behavior: TimeoutBehavior,
    #[serde(serialize_with = "as_millis")]
    pub slow_query_warn_threshold: Duration,
    #[serde(serialize_with = "as_millis")]
    pub cache_ttl: Duration,
    #[serde(serialize_with = "as_millis")]
    pub cache_refresh_after: Duration,
    pub cache_serve_stale_while_refreshing: bool,
    pub cache_max_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            foreign_keys: true,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            busy_timeout: Duration::from_millis(5000),
            guarded_context_timeout: Duration::from_millis(20),
            main_thread_policy: MainThreadPolicy::Warn,
            timeout_behavior: TimeoutBehavior::Throw,
            slow_query_warn_threshold: Duration::from_millis(10),
            cache_ttl: Duration::from_secs(30),
            cache_refresh_after: Duration::from_secs(10),
            cache_serve_stale_while_refreshing: true,
            cache_max_size: 50_000,
        }
    }
}

impl StoreConfig {
    /// Resolve a merged layer into a typed configuration. Keys absent from
    /// the layer keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown enum values and values
    /// that do not parse.
    pub fn from_layer(layer: &ConfigLayer) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = layer.get("foreign-keys") {
            config.foreign_keys = parse_bool(value)
                .ok_or_else(|| invalid("foreign-keys", value, "a boolean"))?;
        }
        if let Some(value) = layer.get("journal-mode") {
            config.journal_mode = parse_choice(
                "journal-mode",
                value,
                &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"],
            )?;
        }
        if let Some(value) = layer.get("synchronous") {
            config.synchronous =
                parse_choice("synchronous", value, &["OFF", "NORMAL", "FULL", "EXTRA"])?;
        }
        if let Some(value) = layer.get("busy-timeout-ms") {
            config.busy_timeout = parse_duration("busy-timeout-ms", value)?;
        }
        if let Some(value) = layer.get("guarded-context-timeout") {
            config.guarded_context_timeout = parse_duration("guarded-context-timeout", value)?;
        }
        if let Some(value) = layer.get("main-thread-policy") {
            config.main_thread_policy = value.parse()?;
        }
        if let Some(value) = layer.get("timeout-behavior") {
            config.timeout_behavior = value.parse()?;
        }
        if let Some(value) = layer.get("slow-query-warn-threshold") {
            config.slow_query_warn_threshold = parse_duration("slow-query-warn-threshold", value)?;
        }
        if let Some(value) = layer.get("cache-ttl") {
            config.cache_ttl = parse_duration("cache-ttl", value)?;
        }
        if let Some(value) = layer.get("cache-refresh-after") {
            config.cache_refresh_after = parse_duration("cache-refresh-after", value)?;
        }
        if let Some(value) = layer.get("cache-serve-stale-while-refreshing") {
            config.cache_serve_stale_while_refreshing = parse_bool(value).ok_or_else(|| {
                invalid("cache-serve-stale-while-refreshing", value, "a boolean")
            })?;
        }
        if let Some(value) = layer.get("cache-max-size") {
            config.cache_max_size = value
                .trim()
                .replace('_', "")
                .parse()
                .map_err(|_| invalid("cache-max-size", value, "a non-negative integer"))?;
        }

        Ok(config)
    }

    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            foreign_keys: self.foreign_keys,
            journal_mode: self.journal_mode.clone(),
            synchronous: self.synchronous.clone(),
            busy_timeout: self.busy_timeout,
        }
    }

    /// Options applied to the `*_blocking` calls' guarded defaults.
    #[must_use]
    pub const fn guarded_options(&self) -> BlockingOptions {
        BlockingOptions {
            timeout: self.guarded_context_timeout,
            main_thread_policy: self.main_thread_policy,
            timeout_behavior: self.timeout_behavior,
            slow_warn_threshold: self.slow_query_warn_threshold,
        }
    }

    /// Policy of the store's query cache. Query-cache reads never block, so
    /// the blocking timeout keeps its default.
    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        CachePolicy::blocking_first_defaults()
            .with_ttl(self.cache_ttl)
            .with_refresh_after(self.cache_refresh_after)
            .with_serve_stale(self.cache_serve_stale_while_refreshing)
            .with_max_size(self.cache_max_size)
    }
}

/// Canonical key: lowercase words joined by `-`. Splits camelCase and treats
/// `_` and `.` as separators.
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.trim().chars() {
        if ch == '_' || ch == '.' || ch == '-' {
            if !out.ends_with('-') && !out.is_empty() {
                out.push('-');
            }
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

fn invalid(key: &str, value: &str, expected: &str) -> StoreError {
    StoreError::Config(format!("invalid value '{value}' for {key}: expected {expected}"))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_choice(key: &str, value: &str, allowed: &[&str]) -> Result<String> {
    let upper = value.trim().to_uppercase();
    if allowed.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(invalid(key, value, &allowed.join(", ")))
    }
}

/// Parse `250`, `250ms`, `2s` or `1m`. Bare numbers are milliseconds.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let trimmed = value.trim().to_lowercase();
    let (digits, unit_ms) = if let Some(ms) = trimmed.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = trimmed.strip_suffix('s') {
        (s, 1000)
    } else if let Some(m) = trimmed.strip_suffix('m') {
        (m, 60_000)
    } else {
        (trimmed.as_str(), 1)
    };
    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "a duration such as 250, 250ms, 2s or 1m"))?;
    amount
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(key, value, "a duration that fits in u64 milliseconds"))
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

fn as_display<T: Display, S: Serializer>(value: &T, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn flatten_yaml(value: &serde_yaml::Value, prefix: &str, out: &mut HashMap<String, String>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (key, value) in map {
                let Some(key_str) = key.as_str() else {
                    continue;
                };
                let next_prefix = if prefix.is_empty() {
                    key_str.to_string()
                } else {
                    format!("{prefix}.{key_str}")
                };
                flatten_yaml(value, &next_prefix, out);
            }
        }
        _ => {
            if let Some(value) = yaml_scalar_to_string(value) {
                out.insert(prefix.to_string(), value);
            }
        }
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Bool(v) => Some(v.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Null
        | serde_yaml::Value::Sequence(_)
        | serde_yaml::Value::Mapping(_) => None,
        serde_yaml::Value::Tagged(tagged) => yaml_scalar_to_string(&tagged.value),
    }
}
