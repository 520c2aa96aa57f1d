//! Runtime Configuration
//!
//! Settings are read from the environment (after `.env` is loaded by the
//! binary) and can be overridden field by field from the command line.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Only a single repair round-trip is ever permitted.
pub const MAX_REPAIR_ATTEMPTS_LIMIT: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dataset to introspect, as `project.dataset`
    pub dataset: String,

    /// Optional explicit table set; narrows the cache-derived allowlist
    #[serde(default)]
    pub allowlist_override: Option<BTreeSet<String>>,

    /// Maximum permitted dry-run estimate in bytes
    pub scan_cap_bytes: u64,

    /// Staleness threshold for the schema cache
    pub cache_ttl_seconds: u64,

    pub max_repair_attempts: u8,

    /// Reject queries with semantic violations instead of warning
    #[serde(default)]
    pub enforce_semantic_rules: bool,

    /// `LIMIT` appended to multi-row queries that lack one
    pub row_cap: u32,

    pub cache_dir: PathBuf,

    /// Warehouse processing location (e.g. `US`)
    pub location: String,

    pub warehouse_timeout_secs: u64,
    pub generation_timeout_secs: u64,

    pub default_model: String,
    pub fallback_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset: "bigquery-public-data.thelook_ecommerce".to_string(),
            allowlist_override: None,
            scan_cap_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            cache_ttl_seconds: 24 * 3600,
            max_repair_attempts: 1,
            enforce_semantic_rules: false,
            row_cap: 200,
            cache_dir: PathBuf::from(".cache"),
            location: "US".to_string(),
            warehouse_timeout_secs: 120,
            generation_timeout_secs: 60,
            default_model: "gpt-4o-mini".to_string(),
            fallback_model: "gpt-4o".to_string(),
        }
    }
}

impl Config {
    /// Build configuration from `GSQL_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dataset) = std::env::var("GSQL_DATASET") {
            config.dataset = dataset;
        }
        if let Ok(tables) = std::env::var("GSQL_ALLOWLIST") {
            config.allowlist_override = parse_table_list(&tables);
        }
        if let Some(v) = env_parse::<u64>("GSQL_SCAN_CAP_BYTES")? {
            config.scan_cap_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("GSQL_CACHE_TTL_SECONDS")? {
            config.cache_ttl_seconds = v;
        }
        if let Some(v) = env_parse::<u8>("GSQL_MAX_REPAIR_ATTEMPTS")? {
            config.max_repair_attempts = v;
        }
        if let Some(v) = env_parse::<bool>("GSQL_ENFORCE_SEMANTICS")? {
            config.enforce_semantic_rules = v;
        }
        if let Some(v) = env_parse::<u32>("GSQL_ROW_CAP")? {
            config.row_cap = v;
        }
        if let Ok(dir) = std::env::var("GSQL_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Ok(location) = std::env::var("GSQL_LOCATION") {
            config.location = location;
        }
        if let Some(v) = env_parse::<u64>("GSQL_WAREHOUSE_TIMEOUT_SECS")? {
            config.warehouse_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("GSQL_GENERATION_TIMEOUT_SECS")? {
            config.generation_timeout_secs = v;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.default_model = model;
        }
        if let Ok(model) = std::env::var("OPENAI_FALLBACK_MODEL") {
            config.fallback_model = model;
        }

        config.validate()
    }

    /// Check invariants and clamp the repair budget.
    pub fn validate(mut self) -> Result<Self> {
        dataset_parts(&self.dataset)?;

        if self.max_repair_attempts > MAX_REPAIR_ATTEMPTS_LIMIT {
            warn!(
                "max_repair_attempts={} exceeds the supported bound, clamping to {}",
                self.max_repair_attempts, MAX_REPAIR_ATTEMPTS_LIMIT
            );
            self.max_repair_attempts = MAX_REPAIR_ATTEMPTS_LIMIT;
        }

        if self.scan_cap_bytes == 0 {
            return Err(AgentError::Config(
                "scan_cap_bytes must be greater than zero".to_string(),
            ));
        }

        if ttl_duration(self.cache_ttl_seconds).is_none() {
            return Err(AgentError::Config(format!(
                "cache_ttl_seconds={} is out of range",
                self.cache_ttl_seconds
            )));
        }

        Ok(self)
    }

    pub fn warehouse_timeout(&self) -> Duration {
        Duration::from_secs(self.warehouse_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Out-of-range values are rejected by `validate`; unvalidated ones
    /// fall back to zero, which always refetches.
    pub fn cache_ttl(&self) -> chrono::Duration {
        ttl_duration(self.cache_ttl_seconds).unwrap_or_else(chrono::Duration::zero)
    }
}

fn ttl_duration(seconds: u64) -> Option<chrono::Duration> {
    i64::try_from(seconds).ok().and_then(chrono::Duration::try_seconds)
}

/// Split `project.dataset` into its two parts.
pub fn dataset_parts(dataset: &str) -> Result<(&str, &str)> {
    match dataset.split_once('.') {
        Some((project, ds)) if !project.is_empty() && !ds.is_empty() && !ds.contains('.') => {
            Ok((project, ds))
        }
        _ => Err(AgentError::Config(format!(
            "dataset must look like 'project.dataset', got '{}'",
            dataset
        ))),
    }
}

fn parse_table_list(raw: &str) -> Option<BTreeSet<String>> {
    let tables: BTreeSet<String> = raw
        .split(',')
        .map(|t| t.trim().trim_matches('`').to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tables.is_empty() {
        None
    } else {
        Some(tables)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AgentError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
