//! Text-level SQL helpers shared by the guard and the generation client.

use crate::guard::tokenizer::{strip_trailing_semicolons, tokenize, TokenKind};

const DANGLING_KEYWORDS: &[&str] = &[
    "from", "where", "and", "or", "join", "on", "between", "select", "with", "by", "as",
];

/// Trim, unify line endings, collapse runs of blank lines into one and drop
/// trailing semicolons along with any comment after them. Applying it twice
/// gives the same result as once.
pub fn normalize_sql(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = Vec::new();
    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() && lines.last().map_or(true, |prev| prev.is_empty()) {
            continue;
        }
        lines.push(line);
    }

    let joined = lines.join("\n");
    strip_trailing_semicolons(joined.trim()).to_string()
}

/// Heuristic check for truncated model output.
pub fn looks_incomplete(sql: &str) -> bool {
    let s = sql.trim();
    if s.is_empty() || s.contains('；') {
        return true;
    }

    // Unterminated quotes and comments fail to tokenize
    let tokens = match tokenize(s) {
        Ok(tokens) => tokens,
        Err(_) => return true,
    };
    let last = match tokens.last() {
        Some(last) => last,
        None => return true,
    };

    if last.is_punct(",") || last.is_punct("(") || last.is_punct(".") {
        return true;
    }
    if last.kind == TokenKind::Number && last.text.ends_with('.') {
        return true;
    }
    if DANGLING_KEYWORDS.iter().any(|k| last.is_word(k)) {
        return true;
    }

    // Parens never close before they open, and all of them close
    let mut depth: i64 = 0;
    let mut top_level = Vec::new();
    for tok in &tokens {
        if tok.is_punct("(") {
            depth += 1;
        } else if tok.is_punct(")") {
            depth -= 1;
            if depth < 0 {
                return true;
            }
        } else if depth == 0 && tok.kind == TokenKind::Word {
            top_level.push(tok);
        }
    }
    if depth != 0 {
        return true;
    }

    // WITH needs a main SELECT outside the CTE bodies
    let mut words = top_level.into_iter();
    if words.next().map_or(false, |w| w.is_word("with")) && !words.any(|w| w.is_word("select")) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sql() {
        let raw = "  SELECT 1\r\n\r\n\r\n  FROM t  \n;;  \n";
        assert_eq!(normalize_sql(raw), "SELECT 1\n\n  FROM t");
    }

    #[test]
    fn test_normalize_drops_semicolon_before_trailing_comment() {
        assert_eq!(normalize_sql("SELECT * FROM orders;\n-- done"), "SELECT * FROM orders");
        assert_eq!(normalize_sql("SELECT * FROM orders; /* end */\n"), "SELECT * FROM orders");
        assert_eq!(normalize_sql("SELECT ';' AS s"), "SELECT ';' AS s");
    }

    #[test]
    fn test_normalize_sql_is_idempotent() {
        let samples = [
            "SELECT a\n\n\n\nFROM t;",
            "\n\n  WITH x AS (SELECT 1)\n \n\t\nSELECT * FROM x ;\n;",
            "SELECT 'a;b' FROM t",
            "SELECT 1;\n-- done\n",
            "SELECT 1 -- note;",
            "",
            ";;;",
        ];
        for raw in samples {
            let once = normalize_sql(raw);
            assert_eq!(normalize_sql(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_looks_incomplete() {
        assert!(looks_incomplete(""));
        assert!(looks_incomplete("SELECT a FROM t WHERE"));
        assert!(looks_incomplete("SELECT a, b,"));
        assert!(looks_incomplete("SELECT COUNT(* FROM t"));
        assert!(looks_incomplete("WITH x AS (SELECT 1)"));
        assert!(looks_incomplete("SELECT 1；"));
        assert!(looks_incomplete("SELECT a FROM t ORDER BY"));
        assert!(looks_incomplete("SELECT a FROM t /* unfinished"));
        assert!(looks_incomplete("SELECT a) FROM (t"));

        assert!(!looks_incomplete("SELECT a FROM t WHERE a = 'where'"));
        assert!(!looks_incomplete("SELECT period FROM t"));
        assert!(!looks_incomplete("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!looks_incomplete("SELECT ')' AS p FROM t"));
        assert!(!looks_incomplete("SELECT a FROM t -- where"));
    }
}
