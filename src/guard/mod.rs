//! SQL Guard
//!
//! Fail-closed validation of generated SQL before it reaches the warehouse:
//! read-only single statements over allowlisted tables only.

pub mod candidate;
pub mod tokenizer;

pub use candidate::*;
pub use tokenizer::*;

use crate::schema_cache::Allowlist;
use crate::semantic::{looks_incomplete, normalize_sql};
use serde::{Deserialize, Serialize};
use std::fmt;
use strsim::jaro_winkler;
use tracing::{debug, warn};

const MUTATION_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "create", "drop", "alter", "truncate", "grant",
    "revoke", "call", "execute", "begin", "commit", "rollback", "transaction", "declare", "set",
];

const HINT_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardReason {
    EmptyQuery,
    MarkdownFenced,
    IncompleteQuery,
    UnsafeStatementType,
    MultipleStatements,
    TableNotAllowed,
    UnsupportedTableReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRejection {
    pub kind: GuardReason,
    pub message: String,
}

impl GuardRejection {
    fn new(kind: GuardReason, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub passed: bool,
    pub reason: Option<GuardRejection>,
    pub normalized_sql: Option<String>,
    /// Derived metadata, present when the SQL passed
    #[serde(skip)]
    pub candidate: Option<CandidateSql>,
}

impl GuardVerdict {
    fn pass(candidate: CandidateSql) -> Self {
        Self {
            passed: true,
            reason: None,
            normalized_sql: Some(candidate.sql.clone()),
            candidate: Some(candidate),
        }
    }

    fn reject(rejection: GuardRejection) -> Self {
        Self {
            passed: false,
            reason: Some(rejection),
            normalized_sql: None,
            candidate: None,
        }
    }
}

/// Stateless; checks run in a fixed order and stop at the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlGuard;

impl SqlGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, raw_sql: &str, allowlist: &Allowlist) -> GuardVerdict {
        match self.check_candidate(raw_sql, allowlist) {
            Ok(candidate) => GuardVerdict::pass(candidate),
            Err(rejection) => GuardVerdict::reject(rejection),
        }
    }

    /// Same checks as [`SqlGuard::check`], as a `Result`.
    pub fn check_candidate(&self, raw_sql: &str, allowlist: &Allowlist) -> Result<CandidateSql, GuardRejection> {
        let result = self.analyze(raw_sql, allowlist);
        match &result {
            Ok(candidate) => debug!("Guard passed; tables: {:?}", candidate.referenced_tables),
            Err(rejection) => warn!("Guard rejected SQL: {}", rejection),
        }
        result
    }

    fn analyze(&self, raw_sql: &str, allowlist: &Allowlist) -> Result<CandidateSql, GuardRejection> {
        let trimmed = raw_sql.trim();
        if trimmed.is_empty() {
            return Err(GuardRejection::new(GuardReason::EmptyQuery, "SQL text is empty"));
        }
        if trimmed.contains("```") || trimmed.starts_with('`') {
            return Err(GuardRejection::new(
                GuardReason::MarkdownFenced,
                "SQL is wrapped in markdown; expected bare SQL",
            ));
        }

        let sql = normalize_sql(trimmed);
        if looks_incomplete(&sql) {
            return Err(GuardRejection::new(
                GuardReason::IncompleteQuery,
                "SQL looks truncated or unbalanced",
            ));
        }

        let tokens = tokenize(&sql).map_err(|e| {
            GuardRejection::new(
                GuardReason::IncompleteQuery,
                format!("SQL contains an unterminated quote or comment: {}", e),
            )
        })?;

        let statement_type = match tokens.first() {
            Some(t) if t.is_word("select") || t.is_word("with") => t.text.to_ascii_uppercase(),
            Some(t) => {
                return Err(GuardRejection::new(
                    GuardReason::UnsafeStatementType,
                    format!("Only SELECT/WITH queries are allowed, got '{}'", t.text),
                ))
            }
            None => return Err(GuardRejection::new(GuardReason::EmptyQuery, "SQL has no tokens")),
        };

        if tokens.iter().any(|t| t.is_punct(";")) {
            return Err(GuardRejection::new(
                GuardReason::MultipleStatements,
                "Multiple statements are not allowed",
            ));
        }

        if let Some(keyword) = tokens
            .iter()
            .find(|t| MUTATION_KEYWORDS.iter().any(|k| t.is_word(k)))
        {
            return Err(GuardRejection::new(
                GuardReason::UnsafeStatementType,
                format!("Keyword '{}' is not allowed in a read-only query", keyword.text.to_ascii_uppercase()),
            ));
        }

        let extracted = extract_tables(&sql, allowlist.dataset()).map_err(|e| match e {
            TableRefError::TableFunction(name) => GuardRejection::new(
                GuardReason::UnsupportedTableReference,
                format!("Table-valued function '{}' is not allowed", name),
            ),
            TableRefError::Unreadable(detail) => GuardRejection::new(
                GuardReason::UnsupportedTableReference,
                format!("Could not read table reference: {}", detail),
            ),
        })?;

        if let Some(table) = extracted.referenced.iter().find(|t| !allowlist.contains(t)) {
            let hint = closest_table(table, allowlist)
                .map(|c| format!(" (did you mean `{}`?)", c))
                .unwrap_or_default();
            return Err(GuardRejection::new(
                GuardReason::TableNotAllowed,
                format!("Table `{}` is not in the allowlist{}", table, hint),
            ));
        }

        Ok(CandidateSql {
            sql,
            statement_type,
            dataset: allowlist.dataset().to_string(),
            referenced_tables: extracted.referenced,
            from_tables: extracted.from_tables,
            aliases: extracted.aliases,
            is_normalized: true,
        })
    }
}

/// Closest allowlisted table by short name, for the rejection hint
fn closest_table<'a>(table: &str, allowlist: &'a Allowlist) -> Option<&'a String> {
    let short = |t: &str| t.rsplit('.').next().unwrap_or(t).to_ascii_lowercase();
    let wanted = short(table);
    allowlist
        .iter()
        .map(|candidate| (jaro_winkler(&wanted, &short(candidate)), candidate))
        .filter(|(score, _)| *score >= HINT_THRESHOLD)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, candidate)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Allowlist {
        Allowlist::new("proj.allowed", ["orders", "users", "order_items"])
    }

    fn reason(sql: &str) -> Option<GuardReason> {
        SqlGuard::new().check(sql, &allowlist()).reason.map(|r| r.kind)
    }

    #[test]
    fn test_passes_allowlisted_select() {
        let verdict = SqlGuard::new().check(
            "SELECT o.order_id FROM `proj.allowed.orders` o JOIN users u ON o.user_id = u.id;\n",
            &allowlist(),
        );
        assert!(verdict.passed);
        assert_eq!(
            verdict.normalized_sql.as_deref(),
            Some("SELECT o.order_id FROM `proj.allowed.orders` o JOIN users u ON o.user_id = u.id")
        );
        let candidate = verdict.candidate.unwrap();
        assert_eq!(candidate.statement_type, "SELECT");
        assert_eq!(candidate.referenced_tables, vec!["proj.allowed.orders", "proj.allowed.users"]);
    }

    #[test]
    fn test_empty_and_fenced() {
        assert_eq!(reason("   "), Some(GuardReason::EmptyQuery));
        assert_eq!(reason("```sql\nSELECT 1\n```"), Some(GuardReason::MarkdownFenced));
        assert_eq!(reason("`SELECT 1`"), Some(GuardReason::MarkdownFenced));
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(reason("SELECT * FROM orders WHERE"), Some(GuardReason::IncompleteQuery));
        assert_eq!(reason("SELECT 'abc FROM orders"), Some(GuardReason::IncompleteQuery));
    }

    #[test]
    fn test_non_select_leading_keyword_is_unsafe() {
        for sql in [
            "DELETE FROM orders WHERE 1=1",
            "UPDATE orders SET status = 'x'",
            "INSERT INTO orders VALUES (1)",
            "CREATE TABLE x AS SELECT 1",
            "EXPLAIN SELECT 1",
        ] {
            assert_eq!(reason(sql), Some(GuardReason::UnsafeStatementType), "{}", sql);
        }
    }

    #[test]
    fn test_multiple_statements_before_allowlist() {
        assert_eq!(
            reason("SELECT * FROM allowed.orders; DROP TABLE allowed.orders;"),
            Some(GuardReason::MultipleStatements)
        );
        // A semicolon inside a literal is data, not a separator
        assert_eq!(reason("SELECT 'a;b' AS s FROM orders"), None);
    }

    #[test]
    fn test_mutation_keyword_outside_literals() {
        assert_eq!(
            reason("WITH x AS (SELECT 1) SELECT * FROM x WHERE EXISTS (DELETE FROM orders)"),
            Some(GuardReason::UnsafeStatementType)
        );
        assert_eq!(reason("SELECT 'drop table' AS note FROM orders"), None);
        assert_eq!(reason("SELECT `update` FROM orders"), None);
    }

    #[test]
    fn test_table_not_allowed_names_table_even_with_allowed_ones() {
        let verdict = SqlGuard::new().check(
            "SELECT * FROM orders o JOIN secrets s ON o.user_id = s.user_id",
            &allowlist(),
        );
        let rejection = verdict.reason.unwrap();
        assert_eq!(rejection.kind, GuardReason::TableNotAllowed);
        assert!(rejection.message.contains("proj.allowed.secrets"));
    }

    #[test]
    fn test_table_not_allowed_hint() {
        let verdict = SqlGuard::new().check("SELECT * FROM order_item", &allowlist());
        let message = verdict.reason.unwrap().message;
        assert!(message.contains("did you mean `proj.allowed.order_items`"), "{}", message);
    }

    #[test]
    fn test_other_dataset_is_not_allowed() {
        assert_eq!(
            reason("SELECT * FROM `proj.other.orders`"),
            Some(GuardReason::TableNotAllowed)
        );
    }

    #[test]
    fn test_trailing_semicolon_before_comment_passes() {
        let verdict = SqlGuard::new().check("SELECT * FROM orders;\n-- done", &allowlist());
        assert!(verdict.passed, "{:?}", verdict.reason);
        assert_eq!(verdict.normalized_sql.as_deref(), Some("SELECT * FROM orders"));
        assert_eq!(
            reason("SELECT * FROM orders; -- done\nSELECT * FROM users"),
            Some(GuardReason::MultipleStatements)
        );
    }

    #[test]
    fn test_tables_hidden_in_from_shapes_are_checked() {
        let allowlist = Allowlist::new("proj.allowed", ["orders", "users"]);
        for sql in [
            "SELECT * FROM orders o JOIN users u ON o.user_id = u.id, `proj.secret.payroll` p",
            "SELECT * FROM (SELECT 1 AS x) s, `proj.secret.payroll` p",
            "SELECT * FROM UNNEST([1,2]) AS x, `proj.secret.payroll` p",
            "SELECT * FROM (`proj.secret.payroll` p JOIN orders o ON p.id = o.user_id)",
        ] {
            let rejection = SqlGuard::new().check(sql, &allowlist).reason.unwrap();
            assert_eq!(rejection.kind, GuardReason::TableNotAllowed, "{}", sql);
            assert!(rejection.message.contains("proj.secret.payroll"), "{}", rejection.message);
        }
    }

    #[test]
    fn test_unreadable_from_item_fails_closed() {
        assert_eq!(
            reason("SELECT * FROM orders o JOIN users u ON o.user_id = u.id, 'payroll'"),
            Some(GuardReason::UnsupportedTableReference)
        );
    }

    #[test]
    fn test_cte_and_extract_pass() {
        let sql = "WITH m AS (\n  SELECT DATE_TRUNC(DATE(o.created_at), MONTH) AS month, COUNT(*) AS orders\n  FROM orders o\n  WHERE EXTRACT(YEAR FROM o.created_at) = 2024\n  GROUP BY month\n)\nSELECT * FROM m ORDER BY month";
        assert_eq!(reason(sql), None);
    }

    #[test]
    fn test_table_function_rejected() {
        assert_eq!(
            reason("SELECT * FROM EXTERNAL_QUERY('conn', 'SELECT 1')"),
            Some(GuardReason::UnsupportedTableReference)
        );
    }
}
