//! Prompt assembly: schema, metrics, semantic hints and output hints.

use crate::assumptions::{wants_active_users_events, wants_mom, wants_monthly};
use crate::llm::Prompt;
use crate::metrics::{render_metrics_block, MetricDefinition};
use crate::schema_cache::{build_prompt_context, Allowlist, SchemaCacheEntry};
use crate::semantic::SemanticRules;

const JOIN_SAFETY: &str = "JOIN SAFETY RULES:
- Do NOT use USING(...). Always use explicit ON conditions.
- If joining monthly CTEs, ensure each CTE outputs a DATE column named `month`, then join with:
  ON a.month = b.month";

const ACTIVE_USERS_RULE: &str = "Active users rule (when the user asks for \"active users\"):
- Use `events` (alias e), active_users = COUNT(DISTINCT e.user_id)
- Time field: DATE(e.created_at)";

/// Everything the model sees for one question, built once per request and
/// reused for the repair prompt.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub question: String,
    pub allowed_tables: Vec<String>,
    pub schema_context: String,
    pub metrics_block: String,
    pub semantic_hints: String,
    pub output_hints: String,
    pub active_users_events: bool,
    pub row_cap: u32,
}

impl PromptContext {
    pub fn build(
        question: &str,
        entry: &SchemaCacheEntry,
        allowlist: &Allowlist,
        metrics: &[&MetricDefinition],
        rules: &SemanticRules,
        row_cap: u32,
    ) -> Self {
        Self {
            question: question.trim().to_string(),
            allowed_tables: allowlist.iter().cloned().collect(),
            schema_context: build_prompt_context(entry, allowlist),
            metrics_block: if metrics.is_empty() {
                String::new()
            } else {
                render_metrics_block(metrics, allowlist)
            },
            semantic_hints: rules.render_prompt_hints(allowlist.dataset()),
            output_hints: output_hints(question, metrics),
            active_users_events: wants_active_users_events(question),
            row_cap,
        }
    }

    pub fn generation_prompt(&self) -> Prompt {
        let header = format!(
            "You are a senior analytics engineer.\n\
             Write ONE BigQuery Standard SQL query to answer the user.\n\n\
             Hard rules:\n{}",
            self.hard_rules()
        );
        Prompt {
            instructions: self.assemble(header, true),
            input: self.question.clone(),
        }
    }

    /// Instructions for the repair round-trip; same grounding, no output hints.
    pub fn repair_instructions(&self) -> String {
        let header = format!(
            "You are fixing a BigQuery Standard SQL query.\n\nRules:\n{}",
            self.hard_rules()
        );
        self.assemble(header, false)
    }

    fn hard_rules(&self) -> String {
        let tables: Vec<String> = self.allowed_tables.iter().map(|t| format!("  - `{}`", t)).collect();
        format!(
            "- Output SQL only. No markdown. No explanation. No trailing semicolon.\n\
             - Use BigQuery Standard SQL.\n\
             - Use fully-qualified table names with backticks.\n\
             - Use ONLY these tables:\n{}\n\
             - Use ONLY columns that exist in the SCHEMA block. Do NOT invent columns.\n\
             - Follow SEMANTIC RULES and METRICS DICTIONARY strictly when relevant.\n\
             - If it could return many rows, add LIMIT {}.",
            tables.join("\n"),
            self.row_cap
        )
    }

    fn assemble(&self, header: String, with_output_hints: bool) -> String {
        let mut sections = vec![header, self.semantic_hints.clone(), JOIN_SAFETY.to_string()];
        if self.active_users_events {
            sections.push(ACTIVE_USERS_RULE.to_string());
        }
        sections.push(self.metrics_block.clone());
        if with_output_hints {
            sections.push(self.output_hints.clone());
        }
        sections.push(self.schema_context.clone());

        sections
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Column naming conventions for monthly and month-over-month answers.
pub fn output_hints(question: &str, metrics: &[&MetricDefinition]) -> String {
    let monthly = wants_monthly(question);
    let mut lines: Vec<String> = Vec::new();

    if monthly {
        lines.push("OUTPUT FORMAT (important):".to_string());
        lines.push(
            "- If grouped by month, include a DATE column named `month` = DATE_TRUNC(DATE(<time_field>), MONTH)."
                .to_string(),
        );
        for metric in metrics {
            if let Some(alias) = &metric.output_alias {
                lines.push(format!(
                    "- If you compute {}, alias the column exactly as `{}`.",
                    metric.name, alias
                ));
            }
        }
    }

    if monthly && wants_mom(question) {
        lines.push(
            "- If MoM is requested, compute base monthly metrics first, then add MoM columns using window LAG over ORDER BY month."
                .to_string(),
        );
    }

    lines.join("\n")
}
