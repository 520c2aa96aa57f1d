//! Warehouse Interface
//!
//! The query engine is a black box: metadata in, byte estimates and row sets
//! out. `bigquery` provides the REST-backed implementation.

pub mod bigquery;

pub use bigquery::BigQueryClient;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One row of column metadata for a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub description: Option<String>,
}

/// Column name → value for a single result row
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub bytes_billed: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &'static str;

    /// Column metadata for every table in `dataset` (`project.dataset`).
    /// Fails with `AgentError::SchemaFetch`.
    async fn fetch_columns(&self, dataset: &str) -> Result<Vec<ColumnRecord>>;

    /// Estimated bytes scanned, without running the query.
    /// Fails with `AgentError::Warehouse` carrying the engine's message.
    async fn dry_run(&self, sql: &str) -> Result<u64>;

    /// Run the query. Fails with `AgentError::Warehouse`.
    async fn execute(&self, sql: &str) -> Result<QueryRows>;
}
