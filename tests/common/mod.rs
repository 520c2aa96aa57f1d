//! Scripted warehouse and generation fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use guarded_sql::error::{AgentError, Result};
use guarded_sql::execution_loop::{QueryRunner, RunnerSettings};
use guarded_sql::llm::{GenerationClient, Prompt, RepairRequest};
use guarded_sql::metrics::thelook_metrics;
use guarded_sql::schema_cache::{ManualClock, MemoryStore, SchemaCache};
use guarded_sql::semantic::thelook_rules;
use guarded_sql::warehouse::{ColumnRecord, QueryRows, Warehouse};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DATASET: &str = "proj.shop";

fn column(table: &str, name: &str, data_type: &str) -> ColumnRecord {
    ColumnRecord {
        table_name: table.to_string(),
        column_name: name.to_string(),
        data_type: data_type.to_string(),
        description: None,
    }
}

pub fn shop_columns() -> Vec<ColumnRecord> {
    vec![
        column("events", "id", "INT64"),
        column("events", "user_id", "INT64"),
        column("events", "created_at", "TIMESTAMP"),
        column("order_items", "id", "INT64"),
        column("order_items", "order_id", "INT64"),
        column("order_items", "user_id", "INT64"),
        column("order_items", "product_id", "INT64"),
        column("order_items", "sale_price", "FLOAT64"),
        column("order_items", "created_at", "TIMESTAMP"),
        column("order_items", "shipped_at", "TIMESTAMP"),
        column("orders", "order_id", "INT64"),
        column("orders", "user_id", "INT64"),
        column("orders", "status", "STRING"),
        column("orders", "created_at", "TIMESTAMP"),
        column("products", "id", "INT64"),
        column("products", "name", "STRING"),
        column("users", "id", "INT64"),
        column("users", "created_at", "TIMESTAMP"),
    ]
}

pub fn one_row(column: &str, value: serde_json::Value) -> QueryRows {
    let mut row = serde_json::Map::new();
    row.insert(column.to_string(), value);
    QueryRows {
        columns: vec![column.to_string()],
        rows: vec![row],
        bytes_billed: 10_485_760,
    }
}

pub struct FakeWarehouse {
    pub columns: Vec<ColumnRecord>,
    pub fail_fetch: AtomicBool,
    pub estimate: AtomicU64,
    /// Consumed front to back; once empty every execution succeeds
    pub execute_script: Mutex<VecDeque<std::result::Result<QueryRows, String>>>,
    pub dry_run_errors: Mutex<VecDeque<String>>,
    pub fetch_calls: AtomicUsize,
    pub dry_run_calls: AtomicUsize,
    pub execute_calls: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self {
            columns: shop_columns(),
            fail_fetch: AtomicBool::new(false),
            estimate: AtomicU64::new(1_000),
            execute_script: Mutex::new(VecDeque::new()),
            dry_run_errors: Mutex::new(VecDeque::new()),
            fetch_calls: AtomicUsize::new(0),
            dry_run_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_estimate(self, bytes: u64) -> Self {
        self.estimate.store(bytes, Ordering::SeqCst);
        self
    }

    pub fn with_execute_errors(self, errors: &[&str]) -> Self {
        {
            let mut script = self.execute_script.lock().unwrap();
            for e in errors {
                script.push_back(Err(e.to_string()));
            }
        }
        self
    }

    pub fn with_dry_run_error(self, error: &str) -> Self {
        self.dry_run_errors.lock().unwrap().push_back(error.to_string());
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn dry_runs(&self) -> usize {
        self.dry_run_calls.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_columns(&self, _dataset: &str) -> Result<Vec<ColumnRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(AgentError::SchemaFetch("Access Denied: dataset proj:shop".to_string()));
        }
        Ok(self.columns.clone())
    }

    async fn dry_run(&self, _sql: &str) -> Result<u64> {
        self.dry_run_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.dry_run_errors.lock().unwrap().pop_front() {
            return Err(AgentError::Warehouse(error));
        }
        Ok(self.estimate.load(Ordering::SeqCst))
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());
        match self.execute_script.lock().unwrap().pop_front() {
            Some(Err(message)) => Err(AgentError::Warehouse(message)),
            Some(Ok(rows)) => Ok(rows),
            None => Ok(one_row("value", json!(42))),
        }
    }
}

/// Returns scripted SQL for generation and repair, counting calls
pub struct ScriptedGenerator {
    generate_script: Mutex<VecDeque<std::result::Result<String, String>>>,
    repair_script: Mutex<VecDeque<std::result::Result<String, String>>>,
    pub generate_calls: AtomicUsize,
    pub repair_calls: AtomicUsize,
    pub repair_requests: Mutex<Vec<RepairRequest>>,
}

impl ScriptedGenerator {
    pub fn new(sql: &str) -> Self {
        Self {
            generate_script: Mutex::new(VecDeque::from(vec![Ok(sql.to_string())])),
            repair_script: Mutex::new(VecDeque::new()),
            generate_calls: AtomicUsize::new(0),
            repair_calls: AtomicUsize::new(0),
            repair_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        let generator = Self::new("");
        *generator.generate_script.lock().unwrap() = VecDeque::from(vec![Err(message.to_string())]);
        generator
    }

    pub fn with_repair(self, sql: &str) -> Self {
        self.repair_script.lock().unwrap().push_back(Ok(sql.to_string()));
        self
    }

    pub fn repairs(&self) -> usize {
        self.repair_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        match self.generate_script.lock().unwrap().pop_front() {
            Some(Ok(sql)) => Ok(sql),
            Some(Err(message)) => Err(AgentError::Generation(message)),
            None => Err(AgentError::Generation("script exhausted".to_string())),
        }
    }

    async fn repair(&self, request: &RepairRequest) -> Result<String> {
        self.repair_calls.fetch_add(1, Ordering::SeqCst);
        self.repair_requests.lock().unwrap().push(request.clone());
        match self.repair_script.lock().unwrap().pop_front() {
            Some(Ok(sql)) => Ok(sql),
            Some(Err(message)) => Err(AgentError::Generation(message)),
            // Hand back the same broken query
            None => Ok(request.failed_sql.clone()),
        }
    }
}

pub fn start_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()))
}

pub fn memory_cache(warehouse: Arc<FakeWarehouse>) -> Arc<SchemaCache> {
    Arc::new(SchemaCache::new(
        DATASET.to_string(),
        chrono::Duration::hours(24),
        warehouse,
        Arc::new(MemoryStore::new()),
        start_clock(),
    ))
}

pub fn settings() -> RunnerSettings {
    RunnerSettings {
        scan_cap_bytes: 1_000_000,
        row_cap: 200,
        ..RunnerSettings::default()
    }
}

pub fn runner_with(
    settings: RunnerSettings,
    warehouse: Arc<FakeWarehouse>,
    generator: Arc<ScriptedGenerator>,
) -> QueryRunner {
    let metrics = Arc::new(thelook_metrics());
    let rules = Arc::new(thelook_rules(&metrics));
    QueryRunner::new(
        settings,
        memory_cache(Arc::clone(&warehouse)),
        metrics,
        rules,
        warehouse,
        generator,
    )
}
