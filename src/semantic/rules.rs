//! Semantic Rules
//!
//! Business meaning the warehouse schema cannot express on its own: which
//! table is the source of truth for a metric, which column is "the" time
//! field, and which joins a table needs.

use crate::guard::CandidateSql;
use crate::schema_cache::qualify_table;
use crate::semantic::time_filter::time_filters;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKey {
    Table(String),
    Metric(String),
}

impl RuleKey {
    fn matches(&self, other: &RuleKey) -> bool {
        match (self, other) {
            (RuleKey::Table(a), RuleKey::Table(b)) => short_name(a).eq_ignore_ascii_case(short_name(b)),
            (RuleKey::Metric(a), RuleKey::Metric(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKey::Table(t) => write!(f, "table {}", t),
            RuleKey::Metric(m) => write!(f, "metric {}", m),
        }
    }
}

/// A logical join between two tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left: String,
    pub right: String,
    pub condition: String,
}

impl JoinSpec {
    pub fn new(left: &str, right: &str, condition: &str) -> Self {
        Self {
            left: left.to_string(),
            right: right.to_string(),
            condition: condition.to_string(),
        }
    }

    /// The table on the other side of `table`, if `table` takes part.
    pub fn partner_of(&self, table: &str) -> Option<&str> {
        let table = short_name(table);
        if short_name(&self.left).eq_ignore_ascii_case(table) {
            Some(&self.right)
        } else if short_name(&self.right).eq_ignore_ascii_case(table) {
            Some(&self.left)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticRule {
    pub key: RuleKey,
    pub canonical_time_field: Option<String>,
    pub canonical_fact_table: Option<String>,
    #[serde(default)]
    pub required_joins: Vec<JoinSpec>,
}

impl SemanticRule {
    pub fn for_table(table: &str, time_field: &str) -> Self {
        Self {
            key: RuleKey::Table(table.to_string()),
            canonical_time_field: Some(time_field.to_string()),
            canonical_fact_table: None,
            required_joins: Vec::new(),
        }
    }

    pub fn for_metric(metric: &str, fact_table: &str, time_field: &str) -> Self {
        Self {
            key: RuleKey::Metric(metric.to_string()),
            canonical_time_field: Some(time_field.to_string()),
            canonical_fact_table: Some(fact_table.to_string()),
            required_joins: Vec::new(),
        }
    }

    pub fn with_required_join(mut self, join: JoinSpec) -> Self {
        self.required_joins.push(join);
        self
    }

    /// Table the time field lives on: the table itself, or a metric's fact table
    pub fn subject_table(&self) -> Option<&str> {
        match &self.key {
            RuleKey::Table(t) => Some(t),
            RuleKey::Metric(_) => self.canonical_fact_table.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    WrongTimeField,
    WrongFactTable,
    MissingJoin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Immutable rule set shared by prompt building and validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticRules {
    rules: Vec<SemanticRule>,
    join_keys: Vec<JoinSpec>,
    #[serde(default)]
    guidance: Vec<String>,
}

impl SemanticRules {
    pub fn new(rules: Vec<SemanticRule>, join_keys: Vec<JoinSpec>) -> Self {
        Self {
            rules,
            join_keys,
            guidance: Vec::new(),
        }
    }

    /// Free-text disambiguation rules appended to the prompt block
    pub fn with_guidance(mut self, guidance: &[&str]) -> Self {
        self.guidance = guidance.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn rules(&self) -> &[SemanticRule] {
        &self.rules
    }

    pub fn join_keys(&self) -> &[JoinSpec] {
        &self.join_keys
    }

    pub fn rules_for(&self, key: &RuleKey) -> Option<&SemanticRule> {
        self.rules.iter().find(|r| r.key.matches(key))
    }

    /// Rules for the tables a query references and the metrics a question
    /// matched, in registry order.
    pub fn applicable(&self, dataset: &str, tables: &[String], metrics: &[&str]) -> Vec<&SemanticRule> {
        self.rules
            .iter()
            .filter(|rule| match &rule.key {
                RuleKey::Table(t) => {
                    let fq = qualify_table(dataset, t);
                    tables.iter().any(|r| r.eq_ignore_ascii_case(&fq))
                }
                RuleKey::Metric(m) => metrics.iter().any(|name| name.eq_ignore_ascii_case(m)),
            })
            .collect()
    }

    pub fn render_prompt_hints(&self, dataset: &str) -> String {
        let mut out = vec![
            "SEMANTIC RULES (follow strictly):".to_string(),
            format!("- Use ONLY tables from dataset `{}`.", dataset),
            "- Only SELECT/WITH queries. Never use INSERT/UPDATE/DELETE/CREATE/DROP/ALTER.".to_string(),
            "- Output SQL only (no markdown, no explanation).".to_string(),
            "- Use fully-qualified table names with backticks.".to_string(),
            "- Do NOT use USING(...) in joins. Always use explicit ON conditions.".to_string(),
        ];

        // Metrics grouped by fact table, first appearance order
        let mut facts: Vec<(&str, &str, Vec<&str>)> = Vec::new();
        for rule in &self.rules {
            if let (RuleKey::Metric(name), Some(fact), Some(time)) =
                (&rule.key, rule.canonical_fact_table.as_deref(), rule.canonical_time_field.as_deref())
            {
                match facts.iter_mut().find(|(f, t, _)| *f == fact && *t == time) {
                    Some((_, _, names)) => names.push(name),
                    None => facts.push((fact, time, vec![name])),
                }
            }
        }
        if !facts.is_empty() {
            out.push(String::new());
            out.push("FACT TABLE GUIDANCE (hard rules):".to_string());
            for (fact, time, names) in facts {
                out.push(format!(
                    "- {}: use `{}` and DATE({}.{}).",
                    names.join(", "),
                    fact,
                    short_name(fact),
                    time
                ));
            }
        }

        let time_rules: Vec<String> = self
            .rules
            .iter()
            .filter_map(|rule| match (&rule.key, &rule.canonical_time_field) {
                (RuleKey::Table(t), Some(field)) => Some(format!("- {}: DATE({}.{})", t, short_name(t), field)),
                _ => None,
            })
            .collect();
        if !time_rules.is_empty() {
            out.push(String::new());
            out.push("TIME FIELD RULES (hard):".to_string());
            out.extend(time_rules);
        }

        let required: Vec<String> = self
            .rules
            .iter()
            .flat_map(|rule| {
                rule.required_joins
                    .iter()
                    .map(move |j| format!("- {} requires a join: {}", rule.key, j.condition))
            })
            .collect();
        if !required.is_empty() {
            out.push(String::new());
            out.push("REQUIRED JOINS:".to_string());
            out.extend(required);
        }

        if !self.join_keys.is_empty() {
            out.push(String::new());
            out.push("JOIN KEYS (logical relationships):".to_string());
            out.extend(self.join_keys.iter().map(|j| format!("- {}", j.condition)));
        }

        if !self.guidance.is_empty() {
            out.push(String::new());
            out.push("DISAMBIGUATION RULES (very important):".to_string());
            out.extend(self.guidance.iter().map(|g| format!("- {}", g)));
        }

        out.join("\n")
    }
}

/// Check a guarded query against the given rules. Every rule is evaluated;
/// the result lists all violations found.
pub fn validate(candidate: &CandidateSql, rules: &[&SemanticRule]) -> Vec<Violation> {
    let filters = time_filters(&candidate.sql);
    let mut violations: Vec<Violation> = Vec::new();
    let mut push = |v: Violation| {
        if !violations.contains(&v) {
            violations.push(v);
        }
    };

    for rule in rules {
        let subject = rule.subject_table().map(|t| qualify_table(&candidate.dataset, t));

        // time field
        if let (Some(subject), Some(field)) = (subject.as_deref(), rule.canonical_time_field.as_deref()) {
            if candidate.references(subject) {
                let wrong = filters.iter().find(|f| {
                    let owner = match &f.qualifier {
                        Some(q) => candidate.resolve_qualifier(q),
                        None => candidate.primary_table(),
                    };
                    owner.map_or(false, |o| o.eq_ignore_ascii_case(subject))
                        && !f.column.eq_ignore_ascii_case(field)
                });
                if let Some(f) = wrong {
                    push(Violation {
                        kind: ViolationKind::WrongTimeField,
                        message: format!(
                            "Time filter uses {}.{}; the time field for {} is {}.{}",
                            short_name(subject),
                            f.column,
                            rule.key,
                            short_name(subject),
                            field
                        ),
                    });
                }
            }
        }

        // fact table
        if let (RuleKey::Metric(name), Some(fact)) = (&rule.key, rule.canonical_fact_table.as_deref()) {
            let fact = qualify_table(&candidate.dataset, fact);
            if !candidate.from_tables.iter().any(|t| t.eq_ignore_ascii_case(&fact)) {
                push(Violation {
                    kind: ViolationKind::WrongFactTable,
                    message: format!(
                        "Metric {} must be computed from `{}`, but the query reads from {}",
                        name,
                        fact,
                        candidate.primary_table().map_or("no table".to_string(), |t| format!("`{}`", t))
                    ),
                });
            }
        }

        // required joins
        if let Some(subject) = subject.as_deref() {
            if !rule.required_joins.is_empty() && candidate.references(subject) {
                let joined = rule
                    .required_joins
                    .iter()
                    .filter_map(|j| j.partner_of(subject))
                    .any(|partner| candidate.references(partner));
                if !joined {
                    let conditions: Vec<&str> = rule.required_joins.iter().map(|j| j.condition.as_str()).collect();
                    push(Violation {
                        kind: ViolationKind::MissingJoin,
                        message: format!(
                            "{} requires a join on one of: {}",
                            short_name(subject),
                            conditions.join("; ")
                        ),
                    });
                }
            }
        }
    }

    violations
}

fn short_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}
