//! Schema cache with TTL, atomic persistence and stale fallback.

use crate::error::{AgentError, Result};
use crate::schema_cache::clock::Clock;
use crate::schema_cache::store::{cache_key, CacheStore};
use crate::schema_cache::types::SchemaCacheEntry;
use crate::warehouse::Warehouse;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a returned snapshot came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotSource {
    /// Fresh entry from memory or the local store; no network access
    Cache,
    /// Newly fetched from the warehouse and persisted
    Fetched,
    /// The fetch failed; an older snapshot is served instead
    StaleFallback { error: String },
}

#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub entry: Arc<SchemaCacheEntry>,
    pub source: SnapshotSource,
}

impl SchemaSnapshot {
    pub fn warning(&self) -> Option<String> {
        match &self.source {
            SnapshotSource::StaleFallback { error } => Some(format!(
                "Schema refresh failed ({}); using cached schema fetched at {}",
                error, self.entry.fetched_at
            )),
            _ => None,
        }
    }
}

pub struct SchemaCache {
    dataset: String,
    ttl: chrono::Duration,
    fetch_timeout: Duration,
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<Arc<SchemaCacheEntry>>>,
}

impl SchemaCache {
    pub fn new(
        dataset: String,
        ttl: chrono::Duration,
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dataset,
            ttl,
            fetch_timeout: Duration::from_secs(120),
            warehouse,
            store,
            clock,
            current: RwLock::new(None),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Return a fresh snapshot, fetching only when the cached one is missing,
    /// malformed, stale, or `force_refresh` is set.
    pub async fn get_schema(&self, force_refresh: bool) -> Result<SchemaSnapshot> {
        let now = self.clock.now();
        let prior = self.prior_entry(now);

        if !force_refresh {
            if let Some(entry) = prior.as_ref() {
                if entry.is_fresh(now, self.ttl) {
                    debug!("Schema cache hit for {} (age {}s)", self.dataset, entry.age(now).num_seconds());
                    return Ok(SchemaSnapshot {
                        entry: Arc::clone(entry),
                        source: SnapshotSource::Cache,
                    });
                }
            }
        }

        match self.fetch().await {
            Ok(entry) => {
                let entry = Arc::new(entry);
                self.persist(&entry);
                self.replace_current(Arc::clone(&entry));
                Ok(SchemaSnapshot {
                    entry,
                    source: SnapshotSource::Fetched,
                })
            }
            Err(e) => match prior {
                Some(entry) => {
                    warn!("Schema fetch for {} failed, serving cached snapshot: {}", self.dataset, e);
                    Ok(SchemaSnapshot {
                        entry,
                        source: SnapshotSource::StaleFallback { error: e.message() },
                    })
                }
                None => Err(AgentError::SchemaFetch(e.message())),
            },
        }
    }

    async fn fetch(&self) -> Result<SchemaCacheEntry> {
        info!("Fetching schema for {}", self.dataset);
        let records = tokio::time::timeout(self.fetch_timeout, self.warehouse.fetch_columns(&self.dataset))
            .await
            .map_err(|_| {
                AgentError::SchemaFetch(format!(
                    "metadata query timed out after {:?}",
                    self.fetch_timeout
                ))
            })??;

        if records.is_empty() {
            return Err(AgentError::SchemaFetch(format!(
                "metadata query returned no columns for {}",
                self.dataset
            )));
        }

        let entry = SchemaCacheEntry::from_columns(&self.dataset, records, self.clock.now());
        info!("Fetched {} tables for {}", entry.tables.len(), self.dataset);
        Ok(entry)
    }

    /// In-memory snapshot when fresh; otherwise the newer of it and the
    /// persisted one (another process may have refreshed the store).
    fn prior_entry(&self, now: chrono::DateTime<chrono::Utc>) -> Option<Arc<SchemaCacheEntry>> {
        let in_memory = self.read_current();
        if let Some(entry) = in_memory.as_ref() {
            if entry.is_fresh(now, self.ttl) {
                return in_memory;
            }
        }

        let persisted = match self.load_persisted() {
            Some(loaded) => Arc::new(loaded),
            None => return in_memory,
        };

        match in_memory {
            Some(entry) if entry.fetched_at >= persisted.fetched_at => Some(entry),
            _ => {
                self.replace_current(Arc::clone(&persisted));
                Some(persisted)
            }
        }
    }

    fn load_persisted(&self) -> Option<SchemaCacheEntry> {
        let key = cache_key(&self.dataset);
        let raw = match self.store.load(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Could not read schema cache {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<SchemaCacheEntry>(&raw) {
            Ok(entry) if entry.dataset == self.dataset && !entry.tables.is_empty() => Some(entry),
            Ok(entry) => {
                warn!(
                    "Ignoring schema cache {}: dataset '{}' with {} tables",
                    key,
                    entry.dataset,
                    entry.tables.len()
                );
                None
            }
            Err(e) => {
                warn!("Ignoring malformed schema cache {}: {}", key, e);
                None
            }
        }
    }

    fn persist(&self, entry: &SchemaCacheEntry) {
        let key = cache_key(&self.dataset);
        let result = serde_json::to_string_pretty(entry)
            .map_err(AgentError::from)
            .and_then(|doc| self.store.save(&key, &doc));
        if let Err(e) = result {
            warn!("Schema snapshot for {} not persisted: {}", self.dataset, e);
        }
    }

    fn read_current(&self) -> Option<Arc<SchemaCacheEntry>> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    fn replace_current(&self, entry: Arc<SchemaCacheEntry>) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(entry);
    }
}
