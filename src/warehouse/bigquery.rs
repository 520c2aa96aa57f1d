//! BigQuery Warehouse Client
//!
//! Talks to the BigQuery v2 REST API (`jobs.query` / `getQueryResults`) with a
//! bearer token. Dry runs and executions go through the same endpoint.

use crate::config::dataset_parts;
use crate::error::{AgentError, Result};
use crate::warehouse::{ColumnRecord, QueryRows, Row, Warehouse};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct BigQueryClient {
    client: Client,
    api_base: String,
    billing_project: String,
    location: String,
    access_token: String,
    timeout: Duration,
}

// jobs.query and getQueryResults share this response shape
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: Option<bool>,
    total_bytes_processed: Option<String>,
    total_bytes_billed: Option<String>,
    schema: Option<TableSchemaJson>,
    #[serde(default)]
    rows: Vec<RowJson>,
    /// Total result rows across all pages
    total_rows: Option<String>,
    /// Present while more result pages remain
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchemaJson {
    #[serde(default)]
    fields: Vec<FieldJson>,
}

#[derive(Debug, Deserialize)]
struct FieldJson {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowJson {
    #[serde(default)]
    f: Vec<CellJson>,
}

#[derive(Debug, Deserialize)]
struct CellJson {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl BigQueryClient {
    pub fn new(
        billing_project: String,
        location: String,
        access_token: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            billing_project,
            location,
            access_token,
            timeout,
        })
    }

    /// Build from `BQ_BILLING_PROJECT`, `BQ_ACCESS_TOKEN` and optionally
    /// `BQ_API_BASE`.
    pub fn from_env(location: &str, timeout: Duration) -> Result<Self> {
        let billing_project = std::env::var("BQ_BILLING_PROJECT")
            .map_err(|_| AgentError::Config("Missing BQ_BILLING_PROJECT".to_string()))?;
        let access_token = std::env::var("BQ_ACCESS_TOKEN")
            .map_err(|_| AgentError::Config("Missing BQ_ACCESS_TOKEN".to_string()))?;

        let mut client = Self::new(billing_project, location.to_string(), access_token, timeout)?;
        if let Ok(base) = std::env::var("BQ_API_BASE") {
            client.api_base = base.trim_end_matches('/').to_string();
        }
        Ok(client)
    }

    async fn post_query(&self, sql: &str, dry_run: bool) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.api_base, self.billing_project);
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "dryRun": dry_run,
            "useQueryCache": !dry_run,
            "location": self.location,
            "timeoutMs": self.timeout.as_millis() as u64,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Warehouse(format!("BigQuery request failed: {}", e)))?;

        self.decode(response).await
    }

    async fn get_results(&self, job: &JobReference, page_token: Option<&str>) -> Result<QueryResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base, self.billing_project, job.job_id
        );
        let location = job.location.as_deref().unwrap_or(&self.location);
        let wait_ms = POLL_INTERVAL.as_millis().to_string();

        let mut params = vec![("location", location), ("timeoutMs", wait_ms.as_str())];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&params)
            .send()
            .await
            .map_err(|e| AgentError::Warehouse(format!("BigQuery request failed: {}", e)))?;

        self.decode(response).await
    }

    async fn decode(&self, response: reqwest::Response) -> Result<QueryResponse> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Warehouse(format!("Failed to read BigQuery response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|env| env.error.message)
                .unwrap_or(text);
            return Err(AgentError::Warehouse(message));
        }

        let parsed: QueryResponse = serde_json::from_str(&text)
            .map_err(|e| AgentError::Warehouse(format!("Failed to parse BigQuery response: {}", e)))?;

        if let Some(err) = parsed.errors.first() {
            return Err(AgentError::Warehouse(
                err.message
                    .clone()
                    .or_else(|| err.reason.clone())
                    .unwrap_or_else(|| "unknown BigQuery error".to_string()),
            ));
        }

        Ok(parsed)
    }

    /// Run to completion, polling while the job is still running.
    async fn run_to_completion(&self, sql: &str) -> Result<QueryResponse> {
        let deadline = Instant::now() + self.timeout;
        let mut response = self.post_query(sql, false).await?;

        while response.job_complete == Some(false) {
            if Instant::now() >= deadline {
                return Err(AgentError::Warehouse(format!(
                    "Query did not complete within {:?}",
                    self.timeout
                )));
            }
            let job = response.job_reference.ok_or_else(|| {
                AgentError::Warehouse("Incomplete job without a job reference".to_string())
            })?;
            debug!("BigQuery job {} still running", job.job_id);
            tokio::time::sleep(POLL_INTERVAL).await;
            response = self.get_results(&job, None).await?;
        }

        Ok(response)
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn fetch_columns(&self, dataset: &str) -> Result<Vec<ColumnRecord>> {
        let (project, ds) = dataset_parts(dataset)?;
        let sql = format!(
            "SELECT c.table_name, c.column_name, c.data_type, f.description \
             FROM `{p}.{d}.INFORMATION_SCHEMA.COLUMNS` c \
             LEFT JOIN `{p}.{d}.INFORMATION_SCHEMA.COLUMN_FIELD_PATHS` f \
             ON f.table_name = c.table_name AND f.column_name = c.column_name AND f.field_path = c.column_name \
             ORDER BY c.table_name, c.ordinal_position",
            p = project,
            d = ds
        );

        info!("Fetching column metadata for {}", dataset);
        let rows = self
            .execute(&sql)
            .await
            .map_err(|e| AgentError::SchemaFetch(e.message()))?;

        rows.rows
            .iter()
            .map(|row| {
                let text = |key: &str| row.get(key).and_then(|v| v.as_str()).map(str::to_string);
                Ok(ColumnRecord {
                    table_name: text("table_name").ok_or_else(|| {
                        AgentError::SchemaFetch("metadata row without table_name".to_string())
                    })?,
                    column_name: text("column_name").ok_or_else(|| {
                        AgentError::SchemaFetch("metadata row without column_name".to_string())
                    })?,
                    data_type: text("data_type").unwrap_or_else(|| "UNKNOWN".to_string()),
                    description: text("description"),
                })
            })
            .collect()
    }

    async fn dry_run(&self, sql: &str) -> Result<u64> {
        let response = self.post_query(sql, true).await?;
        dry_run_bytes(&response)
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        let mut response = self.run_to_completion(sql).await?;
        let job = response.job_reference.take();
        let mut pages = ResultPages::default();

        while let Some(token) = pages.push(response)? {
            let job = job.as_ref().ok_or_else(|| {
                AgentError::Warehouse("Paged result without a job reference".to_string())
            })?;
            debug!("Fetching next result page of job {}", job.job_id);
            response = self.get_results(job, Some(&token)).await?;
        }

        pages.finish()
    }
}

/// Rows gathered across the `pageToken` pages of one query job
#[derive(Default)]
struct ResultPages {
    fields: Vec<FieldJson>,
    rows: Vec<Row>,
    total_rows: Option<u64>,
    bytes_billed: Option<u64>,
}

impl ResultPages {
    /// Add one page; returns the token of the next page, if any.
    fn push(&mut self, page: QueryResponse) -> Result<Option<String>> {
        if self.fields.is_empty() {
            if let Some(schema) = page.schema {
                self.fields = schema.fields;
            }
        }
        if let (None, Some(raw)) = (self.total_rows, page.total_rows.as_deref()) {
            let total = raw
                .parse::<u64>()
                .map_err(|e| AgentError::Warehouse(format!("Invalid row count '{}': {}", raw, e)))?;
            self.total_rows = Some(total);
        }
        if self.bytes_billed.is_none() && page.total_bytes_billed.is_some() {
            self.bytes_billed = Some(parse_bytes(page.total_bytes_billed.as_deref())?);
        }

        let fields = &self.fields;
        self.rows.extend(page.rows.into_iter().map(|row| {
            fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), convert_cell(field, cell.v)))
                .collect::<Row>()
        }));

        Ok(page.page_token.filter(|t| !t.is_empty()))
    }

    fn finish(self) -> Result<QueryRows> {
        if let Some(total) = self.total_rows {
            if self.rows.len() as u64 != total {
                return Err(AgentError::Warehouse(format!(
                    "Received {} of {} result rows",
                    self.rows.len(),
                    total
                )));
            }
        }

        Ok(QueryRows {
            columns: self.fields.iter().map(|f| f.name.clone()).collect(),
            rows: self.rows,
            bytes_billed: self.bytes_billed.unwrap_or(0),
        })
    }
}

/// A dry run without a byte estimate cannot be checked against the scan cap.
fn dry_run_bytes(response: &QueryResponse) -> Result<u64> {
    match response.total_bytes_processed.as_deref() {
        Some(raw) => parse_bytes(Some(raw)),
        None => Err(AgentError::Warehouse(
            "Dry run returned no byte estimate".to_string(),
        )),
    }
}

fn parse_bytes(raw: Option<&str>) -> Result<u64> {
    match raw {
        None => Ok(0),
        Some(s) => s
            .parse::<u64>()
            .map_err(|e| AgentError::Warehouse(format!("Invalid byte count '{}': {}", s, e))),
    }
}

/// BigQuery sends every scalar as a string; restore the obvious types.
fn convert_cell(field: &FieldJson, value: Value) -> Value {
    if field.mode.as_deref() == Some("REPEATED") {
        return value;
    }
    let Some(text) = value.as_str() else {
        return value;
    };
    match field.field_type.as_str() {
        "INTEGER" | "INT64" => text.parse::<i64>().map(Value::from).unwrap_or(value),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => {
            text.parse::<f64>().map(Value::from).unwrap_or(value)
        }
        "BOOLEAN" | "BOOL" => match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value,
        },
        _ => value,
    }
}
