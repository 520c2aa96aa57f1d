//! Metric Dictionary
//!
//! Static registry of business metrics. Questions are matched against metric
//! names and synonyms; matched definitions are folded into the prompt so the
//! model uses the agreed formula, fact table and time field.

use crate::error::{AgentError, Result};
use crate::schema_cache::{qualify_table, Allowlist};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Placeholder for the fact table reference inside formula templates
pub const TABLE_PLACEHOLDER: &str = "{f}";

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "which", "how", "many", "much", "show", "give", "list",
    "last", "this", "that", "from", "per", "by", "of", "in", "on", "to", "is", "are", "was",
    "were", "our", "all", "each", "top", "total", "days", "day", "month", "months", "year",
    "years", "week", "weeks",
];

/// Two-step metric: aggregate per entity, keep entities over a threshold,
/// then count them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualification {
    pub entity_key: String,
    pub qualifying_expr: String,
    pub threshold_op: String,
    pub threshold_value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub synonyms: Vec<String>,
    pub definition: String,
    /// SQL expression template; `{f}` stands for the fact table reference
    pub formula: String,
    /// Owning fact table, short (`orders`) or dataset-qualified
    pub source_table: String,
    /// Conventional alias for the fact table in generated SQL
    pub table_alias: String,
    /// Canonical time column on the fact table
    pub time_field: String,
    pub grain: String,
    /// Column alias requested in monthly output
    #[serde(default)]
    pub output_alias: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub qualification: Option<Qualification>,
}

impl MetricDefinition {
    pub fn new(
        name: impl Into<String>,
        definition: impl Into<String>,
        formula: impl Into<String>,
        source_table: impl Into<String>,
        time_field: impl Into<String>,
    ) -> Self {
        let source_table = source_table.into();
        let short = source_table.rsplit('.').next().unwrap_or(&source_table);
        let table_alias = short
            .split('_')
            .filter_map(|part| part.chars().next())
            .collect::<String>();

        Self {
            name: name.into(),
            synonyms: Vec::new(),
            definition: definition.into(),
            formula: formula.into(),
            table_alias,
            source_table,
            time_field: time_field.into(),
            grain: "row".to_string(),
            output_alias: None,
            notes: Vec::new(),
            qualification: None,
        }
    }

    pub fn with_synonyms(mut self, synonyms: &[&str]) -> Self {
        self.synonyms = synonyms.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.table_alias = alias.into();
        self
    }

    pub fn with_grain(mut self, grain: impl Into<String>) -> Self {
        self.grain = grain.into();
        self
    }

    pub fn with_output_alias(mut self, alias: impl Into<String>) -> Self {
        self.output_alias = Some(alias.into());
        self
    }

    pub fn with_notes(mut self, notes: &[&str]) -> Self {
        self.notes = notes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_qualification(mut self, qualification: Qualification) -> Self {
        self.qualification = Some(qualification);
        self
    }

    /// Formula with the conventional alias substituted, e.g. `SUM(oi.sale_price)`.
    pub fn aliased_formula(&self) -> String {
        self.formula.replace(TABLE_PLACEHOLDER, &self.table_alias)
    }

    /// Time expression on the aliased fact table, e.g. `DATE(oi.created_at)`.
    pub fn aliased_time_field(&self) -> String {
        format!("DATE({}.{})", self.table_alias, self.time_field)
    }

    pub fn source_table_short(&self) -> &str {
        self.source_table.rsplit('.').next().unwrap_or(&self.source_table)
    }

    fn phrases(&self) -> Vec<String> {
        let mut phrases: Vec<String> = Vec::new();
        let candidates = self
            .synonyms
            .iter()
            .map(|s| normalize_text(s))
            .chain(std::iter::once(normalize_text(&self.name.replace('_', " "))));
        for phrase in candidates {
            if !phrase.is_empty() && !phrases.contains(&phrase) {
                phrases.push(phrase);
            }
        }
        phrases
    }
}

/// Relevance of one metric for a question. Exact phrase hits dominate token
/// overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MatchScore {
    pub exact: usize,
    pub overlap: usize,
}

impl MatchScore {
    pub fn is_match(&self) -> bool {
        self.exact > 0 || self.overlap > 0
    }
}

/// Immutable metric registry, shared by reference for the process lifetime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricDictionary {
    metrics: Vec<MetricDefinition>,
}

impl MetricDictionary {
    pub fn new(metrics: Vec<MetricDefinition>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    pub fn score(&self, question: &str, metric: &MetricDefinition) -> MatchScore {
        let question = normalize_text(question);
        let padded = format!(" {} ", question);

        let exact = metric
            .phrases()
            .iter()
            .filter(|p| padded.contains(&format!(" {} ", p)))
            .count();

        let question_tokens = content_tokens(&question);
        let metric_tokens: HashSet<String> = metric
            .phrases()
            .iter()
            .flat_map(|p| content_tokens(p))
            .collect();
        let overlap = question_tokens.intersection(&metric_tokens).count();

        MatchScore { exact, overlap }
    }

    /// Candidate metrics for a question, best first. Ties keep registry order.
    pub fn match_metrics(&self, question: &str) -> Vec<&MetricDefinition> {
        let mut scored: Vec<(MatchScore, &MetricDefinition)> = self
            .metrics
            .iter()
            .map(|m| (self.score(question, m), m))
            .filter(|(score, _)| score.is_match())
            .collect();

        // Stable sort keeps registry order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, m)| m).collect()
    }

    /// Formula with the metric's dataset-qualified fact table substituted.
    pub fn qualify(&self, metric: &MetricDefinition, allowlist: &Allowlist) -> Result<String> {
        let table = qualify_table(allowlist.dataset(), &metric.source_table);
        if !allowlist.contains(&table) {
            return Err(AgentError::Config(format!(
                "Metric '{}' references table '{}' which is not in the allowlist",
                metric.name, table
            )));
        }
        Ok(metric
            .formula
            .replace(TABLE_PLACEHOLDER, &format!("`{}`", table)))
    }
}

/// Prompt block describing the matched metrics.
pub fn render_metrics_block(metrics: &[&MetricDefinition], allowlist: &Allowlist) -> String {
    let mut parts = vec!["METRICS DICTIONARY (use these definitions exactly):".to_string()];

    for metric in metrics {
        let table = qualify_table(allowlist.dataset(), &metric.source_table);
        let alias = &metric.table_alias;
        let mut lines = vec![
            format!("- {}: {}", metric.name, metric.definition),
            format!("  - grain: {}", metric.grain),
            format!("  - synonyms: {}", metric.synonyms.join(", ")),
            format!("  - fact: `{}` AS {}", table, alias),
            format!("  - time_field: {}", metric.aliased_time_field()),
        ];

        match &metric.qualification {
            Some(q) => {
                let expr = q.qualifying_expr.replace(TABLE_PLACEHOLDER, alias);
                let key = q.entity_key.replace(TABLE_PLACEHOLDER, alias);
                lines.push(format!("  - per_entity: {} GROUP BY {}", expr, key));
                lines.push(format!(
                    "  - qualification: {} {} {}",
                    expr, q.threshold_op, q.threshold_value
                ));
            }
            None => lines.push(format!("  - expr: {}", metric.aliased_formula())),
        }

        if !metric.notes.is_empty() {
            lines.push(format!("  - notes: {}", metric.notes.join(" | ")));
        }
        parts.push(lines.join("\n"));
    }

    parts.join("\n")
}

/// Lowercase, keep alphanumerics and `+`, collapse everything else to single spaces.
fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '+' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn content_tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .map(stem)
        .collect()
}

fn stem(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}
