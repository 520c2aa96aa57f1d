//! Query Runner
//!
//! One request end to end: prompt → SQL → guard → semantic checks → dry run
//! → cap → execute, with at most one repair round-trip after a warehouse
//! error.

use crate::assumptions::{infer_assumptions, wants_active_users_events};
use crate::config::{Config, MAX_REPAIR_ATTEMPTS_LIMIT};
use crate::error::{AgentError, Result};
use crate::execution_loop::outcome::{DryRunResult, ExecutionOutcome, RunReport, RunState, RunTrace};
use crate::execution_loop::prompt::PromptContext;
use crate::execution_loop::repair::ErrorRecovery;
use crate::execution_loop::row_cap::apply_row_cap;
use crate::guard::{CandidateSql, GuardVerdict, SqlGuard};
use crate::llm::{GenerationClient, Prompt, RepairRequest};
use crate::metrics::{metric_cards, MetricDefinition, MetricDictionary};
use crate::schema_cache::{build_allowlist, unknown_override_tables, Allowlist, SchemaCache, SchemaCacheEntry};
use crate::semantic::{validate, SemanticRules, Violation};
use crate::warehouse::{QueryRows, Warehouse};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub scan_cap_bytes: u64,
    pub max_repair_attempts: u8,
    pub enforce_semantic_rules: bool,
    pub row_cap: u32,
    pub allowlist_override: Option<BTreeSet<String>>,
    pub warehouse_timeout: Duration,
    pub generation_timeout: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scan_cap_bytes: config.scan_cap_bytes,
            max_repair_attempts: config.max_repair_attempts,
            enforce_semantic_rules: config.enforce_semantic_rules,
            row_cap: config.row_cap,
            allowlist_override: config.allowlist_override.clone(),
            warehouse_timeout: config.warehouse_timeout(),
            generation_timeout: config.generation_timeout(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Guard verdict plus semantic findings for a standalone SQL check
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub verdict: GuardVerdict,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
}

/// Result of one pass through guard, dry run and execution
enum Attempt {
    Done(ExecutionOutcome, RunState),
    WarehouseFailed(String),
}

/// Mutable per-request bookkeeping, folded into the report at the end
#[derive(Default)]
struct Progress {
    trace: RunTrace,
    warnings: Vec<String>,
    violations: Vec<Violation>,
    dry_run: Option<DryRunResult>,
    final_sql: Option<String>,
}

impl Progress {
    fn warn(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

pub struct QueryRunner {
    settings: RunnerSettings,
    schema_cache: Arc<SchemaCache>,
    metrics: Arc<MetricDictionary>,
    rules: Arc<SemanticRules>,
    warehouse: Arc<dyn Warehouse>,
    generator: Arc<dyn GenerationClient>,
    guard: SqlGuard,
    recovery: ErrorRecovery,
}

impl QueryRunner {
    pub fn new(
        settings: RunnerSettings,
        schema_cache: Arc<SchemaCache>,
        metrics: Arc<MetricDictionary>,
        rules: Arc<SemanticRules>,
        warehouse: Arc<dyn Warehouse>,
        generator: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            settings,
            schema_cache,
            metrics,
            rules,
            warehouse,
            generator,
            guard: SqlGuard::new(),
            recovery: ErrorRecovery::new(),
        }
    }

    fn repair_budget(&self) -> u8 {
        self.settings.max_repair_attempts.min(MAX_REPAIR_ATTEMPTS_LIMIT)
    }

    /// Answer a question. Only a schema that cannot be loaded at all is an
    /// `Err`; every other failure is a terminal outcome in the report.
    pub async fn run(&self, question: &str) -> Result<RunReport> {
        let snapshot = self.schema_cache.get_schema(false).await?;
        let mut progress = Progress::default();
        if let Some(warning) = snapshot.warning() {
            progress.warn(warning);
        }

        let allowlist = self.allowlist(&snapshot.entry, &mut progress.warnings);
        let matched = self.select_metrics(question, &allowlist, &mut progress.warnings);
        let metric_names: Vec<&str> = matched.iter().map(|m| m.name.as_str()).collect();
        info!("Question matched metrics: {:?}", metric_names);

        let context = PromptContext::build(
            question,
            &snapshot.entry,
            &allowlist,
            &matched,
            &self.rules,
            self.settings.row_cap,
        );

        let mut repairs_used: u8 = 0;
        let (outcome, state) = match self.generate(&context.generation_prompt()).await {
            Err(e) => {
                warn!("SQL generation failed: {}", e);
                progress.trace.record(RunState::Failed, e.message());
                (ExecutionOutcome::GenerationFailed { message: e.message() }, RunState::Failed)
            }
            Ok(generated) => {
                let mut sql = apply_row_cap(&generated, self.settings.row_cap);
                progress.trace.record(RunState::Generated, sql.clone());

                loop {
                    let message = match self.attempt(&sql, &allowlist, &metric_names, &mut progress).await {
                        Attempt::Done(outcome, state) => break (outcome, state),
                        Attempt::WarehouseFailed(message) => message,
                    };

                    if repairs_used >= self.repair_budget() {
                        warn!("Warehouse error after {} repair(s), giving up: {}", repairs_used, message);
                        progress.trace.record(RunState::Failed, message.clone());
                        break (ExecutionOutcome::WarehouseError { message }, RunState::Failed);
                    }

                    repairs_used += 1;
                    let failed_sql = progress.final_sql.clone().unwrap_or_else(|| sql.clone());
                    let request = self.recovery.build_repair_request(&context, &failed_sql, &message);
                    info!("Repair attempt {} of {}", repairs_used, self.repair_budget());

                    match self.repair(&request).await {
                        Ok(fixed) => {
                            sql = apply_row_cap(&fixed, self.settings.row_cap);
                            progress.trace.record(RunState::Repaired, sql.clone());
                        }
                        Err(e) => {
                            let message = format!("repair after warehouse error ({}) failed: {}", message, e.message());
                            progress.trace.record(RunState::Failed, message.clone());
                            break (ExecutionOutcome::GenerationFailed { message }, RunState::Failed);
                        }
                    }
                }
            }
        };

        info!("Run finished in state {:?}: {}", state, outcome.summary());

        Ok(RunReport {
            question: question.to_string(),
            outcome,
            final_sql: progress.final_sql,
            state,
            repairs_used,
            dry_run: progress.dry_run,
            violations: progress.violations,
            warnings: progress.warnings,
            assumptions: infer_assumptions(question),
            matched_metrics: metric_names.iter().map(|m| m.to_string()).collect(),
            metric_cards: metric_cards(question, &matched),
            schema_source: snapshot.source.clone(),
            trace: progress.trace,
        })
    }

    /// Guard and semantic rules against the cached allowlist, without
    /// touching the warehouse beyond loading the schema.
    pub async fn check(&self, sql: &str) -> Result<CheckReport> {
        let snapshot = self.schema_cache.get_schema(false).await?;
        let mut warnings: Vec<String> = snapshot.warning().into_iter().collect();
        let allowlist = self.allowlist(&snapshot.entry, &mut warnings);

        let verdict = self.guard.check(sql, &allowlist);
        let violations = verdict
            .candidate
            .as_ref()
            .map(|candidate| self.semantic_violations(candidate, &[]))
            .unwrap_or_default();

        Ok(CheckReport {
            verdict,
            violations,
            warnings,
        })
    }

    /// Cache-derived allowlist, narrowed by the configured override.
    pub fn allowlist(&self, entry: &SchemaCacheEntry, warnings: &mut Vec<String>) -> Allowlist {
        let wanted = self.settings.allowlist_override.as_ref();
        for table in unknown_override_tables(entry, wanted) {
            let message = format!("Allowlist override table `{}` is not in the schema snapshot; dropped", table);
            warn!("{}", message);
            warnings.push(message);
        }
        build_allowlist(entry, wanted)
    }

    /// Matched metrics whose fact table is allowlisted. A metric that cannot
    /// be qualified is dropped with a warning; the request goes on.
    pub fn select_metrics<'a>(
        &'a self,
        question: &str,
        allowlist: &Allowlist,
        warnings: &mut Vec<String>,
    ) -> Vec<&'a MetricDefinition> {
        let events_based = wants_active_users_events(question);
        self.metrics
            .match_metrics(question)
            .into_iter()
            .filter(|m| !(events_based && m.name == "ACTIVE_BUYERS"))
            .filter(|m| match self.metrics.qualify(m, allowlist) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Dropping metric {}: {}", m.name, e);
                    warnings.push(e.message());
                    false
                }
            })
            .collect()
    }

    fn semantic_violations(&self, candidate: &CandidateSql, metric_names: &[&str]) -> Vec<Violation> {
        let rules = self
            .rules
            .applicable(&candidate.dataset, &candidate.referenced_tables, metric_names);
        validate(candidate, &rules)
    }

    async fn attempt(
        &self,
        sql: &str,
        allowlist: &Allowlist,
        metric_names: &[&str],
        progress: &mut Progress,
    ) -> Attempt {
        let candidate = match self.guard.check_candidate(sql, allowlist) {
            Ok(candidate) => candidate,
            Err(rejection) => {
                progress.final_sql = Some(sql.to_string());
                progress.trace.record(RunState::Rejected, rejection.to_string());
                return Attempt::Done(ExecutionOutcome::GuardRejected(rejection), RunState::Rejected);
            }
        };
        progress.final_sql = Some(candidate.sql.clone());
        progress.trace.record(RunState::Guarded, candidate.referenced_tables.join(", "));

        let violations = self.semantic_violations(&candidate, metric_names);
        progress.violations = violations.clone();
        if !violations.is_empty() {
            for v in &violations {
                warn!("Semantic violation: {}", v);
            }
            if self.settings.enforce_semantic_rules {
                progress.trace.record(RunState::Rejected, format!("{} semantic violation(s)", violations.len()));
                return Attempt::Done(ExecutionOutcome::SemanticRejected(violations), RunState::Rejected);
            }
            for v in &violations {
                progress.warn(format!("Semantic rule: {}", v.message));
            }
        }

        let estimated_bytes = match self.dry_run(&candidate.sql).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dry run failed: {}", e);
                progress.trace.record(RunState::Errored, e.message());
                return Attempt::WarehouseFailed(e.message());
            }
        };

        let dry_run = DryRunResult::new(estimated_bytes, self.settings.scan_cap_bytes);
        progress.dry_run = Some(dry_run);
        progress.trace.record(RunState::DryRun, format!("{} bytes", estimated_bytes));
        info!("Dry run estimate: {} bytes (cap {})", estimated_bytes, self.settings.scan_cap_bytes);

        if dry_run.would_exceed_cap {
            let reason = format!(
                "Estimated scan of {} bytes exceeds the cap of {} bytes",
                estimated_bytes, self.settings.scan_cap_bytes
            );
            warn!("{}", reason);
            progress.trace.record(RunState::Blocked, reason.clone());
            return Attempt::Done(
                ExecutionOutcome::Blocked {
                    reason,
                    estimated_bytes,
                },
                RunState::Blocked,
            );
        }

        match self.execute(&candidate.sql).await {
            Ok(result) => {
                progress
                    .trace
                    .record(RunState::Executed, format!("{} rows", result.rows.len()));
                Attempt::Done(
                    ExecutionOutcome::Success {
                        columns: result.columns,
                        rows: result.rows,
                        bytes_billed: result.bytes_billed,
                    },
                    RunState::Executed,
                )
            }
            Err(e) => {
                warn!("Execution failed: {}", e);
                progress.trace.record(RunState::Errored, e.message());
                Attempt::WarehouseFailed(e.message())
            }
        }
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let timeout = self.settings.generation_timeout;
        tokio::time::timeout(timeout, self.generator.generate(prompt))
            .await
            .map_err(|_| AgentError::Generation(format!("generation timed out after {:?}", timeout)))?
    }

    async fn repair(&self, request: &RepairRequest) -> Result<String> {
        let timeout = self.settings.generation_timeout;
        tokio::time::timeout(timeout, self.generator.repair(request))
            .await
            .map_err(|_| AgentError::Generation(format!("repair timed out after {:?}", timeout)))?
    }

    async fn dry_run(&self, sql: &str) -> Result<u64> {
        let timeout = self.settings.warehouse_timeout;
        tokio::time::timeout(timeout, self.warehouse.dry_run(sql))
            .await
            .map_err(|_| AgentError::Warehouse(format!("dry run timed out after {:?}", timeout)))?
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        let timeout = self.settings.warehouse_timeout;
        tokio::time::timeout(timeout, self.warehouse.execute(sql))
            .await
            .map_err(|_| AgentError::Warehouse(format!("query timed out after {:?}", timeout)))?
    }
}
