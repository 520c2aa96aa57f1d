//! Row cap for multi-row answers.

use crate::guard::tokenizer::{strip_trailing_semicolons, tokenize, TokenKind};

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max"];

/// Append `LIMIT row_cap` to queries that likely return many rows and carry
/// no LIMIT of their own. Single-row aggregates are left alone.
pub fn apply_row_cap(sql: &str, row_cap: u32) -> String {
    let sql = strip_trailing_semicolons(sql.trim());
    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(_) => return sql.to_string(),
    };
    let has = |word: &str| tokens.iter().any(|t| t.is_word(word));

    if has("limit") {
        return sql.to_string();
    }

    let grouped = tokens
        .windows(2)
        .any(|w| w[0].is_word("group") && w[1].is_word("by"));
    let ordered = tokens
        .windows(2)
        .any(|w| w[0].is_word("order") && w[1].is_word("by"));
    let likely_multi = grouped || ordered || has("join");

    let scalar_aggregate = !grouped
        && tokens.windows(2).any(|w| {
            w[0].kind == TokenKind::Word
                && AGGREGATES.iter().any(|a| w[0].text.eq_ignore_ascii_case(a))
                && w[1].is_punct("(")
        });

    if likely_multi && !scalar_aggregate {
        format!("{}\nLIMIT {}", sql, row_cap)
    } else {
        sql.to_string()
    }
}
