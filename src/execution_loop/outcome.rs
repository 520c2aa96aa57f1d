//! Run states, outcomes and the per-request report.

use crate::guard::GuardRejection;
use crate::metrics::MetricCard;
use crate::schema_cache::SnapshotSource;
use crate::semantic::Violation;
use crate::warehouse::Row;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Generated,
    Guarded,
    DryRun,
    Blocked,
    Executed,
    Errored,
    Repaired,
    Failed,
    Rejected,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Blocked | RunState::Executed | RunState::Failed | RunState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at: DateTime<Utc>,
    pub state: RunState,
    pub detail: String,
}

/// Ordered record of state transitions for one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTrace {
    events: Vec<TraceEvent>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, state: RunState, detail: impl Into<String>) {
        self.events.push(TraceEvent {
            at: Utc::now(),
            state,
            detail: detail.into(),
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn states(&self) -> Vec<RunState> {
        self.events.iter().map(|e| e.state).collect()
    }

    pub fn last_state(&self) -> Option<RunState> {
        self.events.last().map(|e| e.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunResult {
    pub estimated_bytes: u64,
    pub would_exceed_cap: bool,
}

impl DryRunResult {
    pub fn new(estimated_bytes: u64, scan_cap_bytes: u64) -> Self {
        Self {
            estimated_bytes,
            would_exceed_cap: estimated_bytes > scan_cap_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Success {
        columns: Vec<String>,
        rows: Vec<Row>,
        bytes_billed: u64,
    },
    Blocked {
        reason: String,
        estimated_bytes: u64,
    },
    WarehouseError {
        message: String,
    },
    GuardRejected(GuardRejection),
    SemanticRejected(Vec<Violation>),
    GenerationFailed {
        message: String,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Short human-readable summary
    pub fn summary(&self) -> String {
        match self {
            ExecutionOutcome::Success { rows, bytes_billed, .. } => {
                format!("{} rows, {} bytes billed", rows.len(), bytes_billed)
            }
            ExecutionOutcome::Blocked { reason, .. } => format!("Blocked: {}", reason),
            ExecutionOutcome::WarehouseError { message } => format!("Warehouse error: {}", message),
            ExecutionOutcome::GuardRejected(rejection) => format!("Rejected by guard: {}", rejection),
            ExecutionOutcome::SemanticRejected(violations) => format!(
                "Rejected by semantic rules: {}",
                violations.iter().join("; ")
            ),
            ExecutionOutcome::GenerationFailed { message } => format!("Generation failed: {}", message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub question: String,
    pub outcome: ExecutionOutcome,
    /// SQL of the last attempt, as sent (or as it would have been sent)
    pub final_sql: Option<String>,
    pub state: RunState,
    pub repairs_used: u8,
    pub dry_run: Option<DryRunResult>,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
    pub assumptions: Vec<String>,
    pub matched_metrics: Vec<String>,
    pub metric_cards: Vec<MetricCard>,
    pub schema_source: SnapshotSource,
    pub trace: RunTrace,
}
