//! Time-range predicates in WHERE clauses.

use crate::guard::tokenizer::{tokenize, Token, TokenKind};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DATE_LITERAL: Regex = Regex::new(r"^\d{4}-\d{2}(-\d{2})?").unwrap();
}

const REGION_END: &[&str] = &[
    "group", "order", "having", "limit", "qualify", "window", "union", "except", "intersect",
];

const COMPARISONS: &[&str] = &["=", "<", ">", "<=", ">=", "<>", "!="];

/// Words that make an expression a point in time
const TEMPORAL_WORDS: &[&str] = &[
    "current_date", "current_timestamp", "current_datetime", "date_sub", "date_add",
    "datetime_sub", "datetime_add", "timestamp_sub", "timestamp_add", "interval", "parse_date",
    "parse_timestamp", "date_trunc", "timestamp_trunc", "unix_date",
];

/// Words that are never column names inside a predicate
const NON_COLUMN_WORDS: &[&str] = &[
    "not", "is", "null", "in", "like", "as", "true", "false", "case", "when", "then", "else",
    "end", "date", "timestamp", "datetime", "time", "interval", "current_date",
    "current_timestamp", "current_datetime", "day", "week", "isoweek", "month", "quarter",
    "year", "isoyear", "hour", "minute", "second", "millisecond", "microsecond", "and", "or",
    "between", "select", "from", "exists", "any", "all", "some", "distinct",
];

/// A column compared against a point in time, e.g. `DATE(o.created_at) >= ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeFilter {
    pub qualifier: Option<String>,
    pub column: String,
}

pub fn time_filters(sql: &str) -> Vec<TimeFilter> {
    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(_) => return Vec::new(),
    };
    let mut filters: Vec<TimeFilter> = Vec::new();

    for (i, tok) in tokens.iter().enumerate() {
        if !tok.is_word("where") {
            continue;
        }
        let region = where_region(&tokens, i + 1);
        for predicate in split_predicates(region) {
            for filter in predicate_filters(predicate) {
                if !filters.contains(&filter) {
                    filters.push(filter);
                }
            }
        }
    }

    filters
}

/// Tokens from `start` up to the end of the WHERE clause at its depth.
fn where_region(tokens: &[Token], start: usize) -> &[Token] {
    let mut depth: i32 = 0;
    let mut end = start;
    while end < tokens.len() {
        let tok = &tokens[end];
        if tok.is_punct("(") {
            depth += 1;
        } else if tok.is_punct(")") {
            depth -= 1;
            if depth < 0 {
                break;
            }
        } else if depth == 0 && REGION_END.iter().any(|w| tok.is_word(w)) {
            break;
        }
        end += 1;
    }
    &tokens[start..end]
}

/// Split on AND/OR, keeping `BETWEEN x AND y` together.
fn split_predicates(region: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_between = false;

    for (i, tok) in region.iter().enumerate() {
        if tok.is_word("between") {
            in_between = true;
        } else if tok.is_word("and") && in_between {
            in_between = false;
        } else if tok.is_word("and") || tok.is_word("or") {
            parts.push(&region[start..i]);
            start = i + 1;
        }
    }
    parts.push(&region[start..]);
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn predicate_filters(predicate: &[Token]) -> Vec<TimeFilter> {
    let Some(op) = predicate
        .iter()
        .position(|t| t.is_word("between") || (t.kind == TokenKind::Punct && COMPARISONS.contains(&t.text.as_str())))
    else {
        return Vec::new();
    };

    let (lhs, rhs) = (&predicate[..op], &predicate[op + 1..]);
    let (lhs_cols, rhs_cols) = (column_refs(lhs), column_refs(rhs));

    // EXTRACT(YEAR FROM col) = 2024 compares a date part against a number
    let extracts_part = lhs.first().map_or(false, |t| t.is_word("extract"));

    if !lhs_cols.is_empty() && rhs_cols.is_empty() && (extracts_part || is_temporal(rhs)) {
        lhs_cols
    } else if lhs_cols.is_empty() && !rhs_cols.is_empty() && is_temporal(lhs) && !predicate[op].is_word("between") {
        rhs_cols
    } else {
        Vec::new()
    }
}

fn is_temporal(side: &[Token]) -> bool {
    side.iter().any(|t| match t.kind {
        TokenKind::Word => TEMPORAL_WORDS.iter().any(|w| t.text.eq_ignore_ascii_case(w)),
        TokenKind::StringLit => DATE_LITERAL.is_match(&t.text),
        _ => false,
    })
}

/// Column references (possibly qualified) on one side of a comparison.
fn column_refs(side: &[Token]) -> Vec<TimeFilter> {
    let mut refs = Vec::new();
    let mut i = 0;

    while i < side.len() {
        let tok = &side[i];
        let starts_ref = tok.is_ident() && (i == 0 || !side[i - 1].is_punct("."));
        if !starts_ref {
            i += 1;
            continue;
        }

        let mut parts: Vec<&str> = tok.text.split('.').collect();
        let mut j = i + 1;
        while j + 1 < side.len() && side[j].is_punct(".") && side[j + 1].is_ident() {
            parts.extend(side[j + 1].text.split('.'));
            j += 2;
        }

        let is_call = side.get(j).map_or(false, |t| t.is_punct("("));
        let is_keyword = tok.kind == TokenKind::Word
            && parts.len() == 1
            && NON_COLUMN_WORDS.iter().any(|w| tok.text.eq_ignore_ascii_case(w));

        if !is_call && !is_keyword {
            if let Some((column, rest)) = parts.split_last() {
                refs.push(TimeFilter {
                    qualifier: rest.last().map(|q| q.to_string()),
                    column: column.to_string(),
                });
            }
        }
        i = j;
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(qualifier: Option<&str>, column: &str) -> TimeFilter {
        TimeFilter {
            qualifier: qualifier.map(str::to_string),
            column: column.to_string(),
        }
    }

    #[test]
    fn test_relative_window_filter() {
        let sql = "SELECT SUM(amount) FROM orders WHERE created_at >= DATE_SUB(CURRENT_DATE(), INTERVAL 30 DAY)";
        assert_eq!(time_filters(sql), vec![filter(None, "created_at")]);
    }

    #[test]
    fn test_wrapped_and_qualified_columns() {
        let sql = "SELECT 1 FROM `p.d.orders` o WHERE DATE(o.created_at) BETWEEN '2024-01-01' AND '2024-03-31' AND o.status = 'Complete'";
        assert_eq!(time_filters(sql), vec![filter(Some("o"), "created_at")]);
    }

    #[test]
    fn test_non_time_and_column_to_column_predicates_ignored() {
        let sql = "SELECT 1 FROM t WHERE a.x = b.y AND status = 'shipped' AND n > 5";
        assert!(time_filters(sql).is_empty());
    }

    #[test]
    fn test_extract_year_is_a_time_filter() {
        let sql = "SELECT 1 FROM users u WHERE EXTRACT(YEAR FROM u.created_at) = 2024";
        assert_eq!(time_filters(sql), vec![filter(Some("u"), "created_at")]);
    }

    #[test]
    fn test_where_inside_cte_ends_at_group_by() {
        let sql = "WITH m AS (SELECT user_id FROM orders WHERE EXTRACT(YEAR FROM created_at) = 2024 \
                   AND created_at < TIMESTAMP('2025-01-01') GROUP BY user_id) SELECT * FROM m";
        assert_eq!(time_filters(sql), vec![filter(None, "created_at")]);
    }
}
