//! Candidate SQL and the table references derived from it.

use crate::guard::tokenizer::{tokenize, Token, TokenKind};
use crate::schema_cache::qualify_table;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Functions whose argument list may contain a non-clause `FROM`
const FROM_ARG_FUNCTIONS: &[&str] = &["extract", "substring", "trim", "position", "overlay"];

/// Words that end a table reference instead of naming its alias
const CLAUSE_WORDS: &[&str] = &[
    "where", "join", "left", "right", "inner", "full", "cross", "natural", "outer", "on", "using",
    "group", "order", "limit", "having", "qualify", "window", "union", "except", "intersect",
    "for", "tablesample", "with", "select", "pivot", "unpivot", "and", "or", "as", "from",
];

/// Generated SQL after normalization, with derived metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSql {
    pub sql: String,
    /// Leading keyword, uppercased (`SELECT` or `WITH` once guarded)
    pub statement_type: String,
    /// Dataset unqualified references resolve against
    pub dataset: String,
    /// Fully-qualified tables in order of first appearance
    pub referenced_tables: Vec<String>,
    /// Tables that appear directly after a `FROM`, fully-qualified
    pub from_tables: Vec<String>,
    /// Lowercased alias → fully-qualified table
    pub aliases: BTreeMap<String, String>,
    pub is_normalized: bool,
}

impl CandidateSql {
    /// Resolve a column qualifier (alias, short or qualified table name) to a
    /// referenced table.
    pub fn resolve_qualifier(&self, qualifier: &str) -> Option<&str> {
        let q = qualifier.trim_matches('`').to_ascii_lowercase();
        if let Some(table) = self.aliases.get(&q) {
            return Some(table.as_str());
        }
        self.referenced_tables
            .iter()
            .find(|t| {
                t.eq_ignore_ascii_case(&q)
                    || t.rsplit('.').next().map_or(false, |short| short.eq_ignore_ascii_case(&q))
            })
            .map(String::as_str)
    }

    pub fn references(&self, table: &str) -> bool {
        let fq = qualify_table(&self.dataset, table);
        self.referenced_tables.iter().any(|t| t.eq_ignore_ascii_case(&fq))
    }

    pub fn primary_table(&self) -> Option<&str> {
        self.from_tables.first().map(String::as_str)
    }
}

/// Why a table reference could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRefError {
    TableFunction(String),
    Unreadable(String),
}

#[derive(Debug, Default)]
pub(crate) struct ExtractedTables {
    pub referenced: Vec<String>,
    pub from_tables: Vec<String>,
    pub aliases: BTreeMap<String, String>,
}

/// Clauses that end a `FROM` list at their nesting level
const FROM_CLAUSE_END: &[&str] = &[
    "where", "group", "having", "qualify", "window", "order", "limit", "union", "except",
    "intersect", "select",
];

/// What an open paren or bracket holds
#[derive(Debug)]
enum Group {
    /// Function call or plain grouping; the name is the preceding word
    Call(Option<String>),
    /// `( SELECT ... )` or `( WITH ... )` in table position
    Subquery,
    /// `( t1 JOIN t2 ... )` in table position
    Join,
}

/// Per-level state of the walk
#[derive(Debug, Default)]
struct Level {
    /// Inside a `FROM` list, so a `,` starts another table
    in_from: bool,
    /// The next token starts a table reference
    expect_table: bool,
    /// The pending table came from `FROM` or `,` rather than `JOIN`
    from_position: bool,
}

/// Walk the token stream and collect every table in a `FROM` list: comma
/// joins, `JOIN`s, parenthesized joins and tables after derived tables or
/// `UNNEST(...)`. CTE names and array paths are skipped. Anything in table
/// position that is not a plain path fails.
pub(crate) fn extract_tables(sql: &str, dataset: &str) -> Result<ExtractedTables, TableRefError> {
    let tokens =
        tokenize(sql).map_err(|e| TableRefError::Unreadable(format!("cannot tokenize SQL: {}", e)))?;
    let ctes = cte_names(&tokens);
    let mut out = ExtractedTables::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut groups: Vec<Group> = Vec::new();
    let mut levels: Vec<Level> = vec![Level::default()];

    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        let level = levels.len() - 1;

        if levels[level].expect_table {
            levels[level].expect_table = false;
            let from_position = levels[level].from_position;

            if tok.is_punct("(") {
                let group = match tokens.get(i + 1) {
                    Some(next) if next.is_word("select") || next.is_word("with") => Group::Subquery,
                    _ => Group::Join,
                };
                let inner = Level {
                    in_from: matches!(group, Group::Join),
                    expect_table: matches!(group, Group::Join),
                    from_position,
                };
                groups.push(group);
                levels.push(inner);
                i += 1;
                continue;
            }

            if tok.is_word("unnest") && tokens.get(i + 1).map_or(false, |t| t.is_punct("(")) {
                // the paren is opened as a call on the next step
                i += 1;
                continue;
            }

            if !tok.is_ident() {
                return Err(TableRefError::Unreadable(format!(
                    "unexpected '{}' after FROM/JOIN",
                    tok.text
                )));
            }

            i = read_table(&tokens, i, from_position, dataset, &ctes, &mut out, &mut seen)?;
            continue;
        }

        if tok.is_punct("(") || tok.is_punct("[") {
            let func = i
                .checked_sub(1)
                .map(|p| &tokens[p])
                .filter(|p| p.kind == TokenKind::Word)
                .map(|p| p.text.to_ascii_lowercase());
            groups.push(Group::Call(func));
            levels.push(Level::default());
            i += 1;
            continue;
        }

        if tok.is_punct(")") || tok.is_punct("]") {
            groups.pop();
            if levels.len() > 1 {
                levels.pop();
            }
            i += 1;
            continue;
        }

        let current = &mut levels[level];
        if tok.is_word("from") {
            if !from_is_argument(&tokens, i, &groups) {
                current.in_from = true;
                current.expect_table = true;
                current.from_position = true;
            }
        } else if tok.is_word("join") {
            current.in_from = true;
            current.expect_table = true;
            current.from_position = false;
        } else if tok.is_punct(",") && current.in_from {
            current.expect_table = true;
            current.from_position = true;
        } else if tok.kind == TokenKind::Word
            && FROM_CLAUSE_END.iter().any(|w| tok.text.eq_ignore_ascii_case(w))
        {
            current.in_from = false;
        }
        i += 1;
    }

    if levels.iter().any(|l| l.expect_table) {
        return Err(TableRefError::Unreadable("missing table after FROM/JOIN".to_string()));
    }

    Ok(out)
}

/// `FROM` inside `EXTRACT(x FROM y)` and friends, or `IS [NOT] DISTINCT FROM`
fn from_is_argument(tokens: &[Token], i: usize, groups: &[Group]) -> bool {
    let in_function = match groups.last() {
        Some(Group::Call(Some(f))) => FROM_ARG_FUNCTIONS.contains(&f.as_str()),
        _ => false,
    };
    let after_distinct = i >= 2
        && tokens[i - 1].is_word("distinct")
        && (tokens[i - 2].is_word("is") || tokens[i - 2].is_word("not"));
    in_function || after_distinct
}

/// Read one table reference and its alias starting at `i`. Returns the index
/// of the first token after it.
fn read_table(
    tokens: &[Token],
    mut i: usize,
    from_position: bool,
    dataset: &str,
    ctes: &HashSet<String>,
    out: &mut ExtractedTables,
    seen: &mut HashSet<String>,
) -> Result<usize, TableRefError> {
    let (path, parts, next) = read_path(tokens, i);
    i = next;

    if tokens.get(i).map_or(false, |t| t.is_punct("(")) {
        return Err(TableRefError::TableFunction(path));
    }

    let first = parts
        .first()
        .map(|p| p.to_ascii_lowercase())
        .ok_or_else(|| TableRefError::Unreadable(format!("empty table path '{}'", path)))?;
    let is_cte = parts.len() == 1 && ctes.contains(&first);
    // `FROM t, t.items` walks an array column of an earlier alias
    let is_array_path = parts.len() > 1 && out.aliases.contains_key(&first);

    let table = if is_cte || is_array_path {
        None
    } else {
        let fq = qualify_table(dataset, &path);
        if seen.insert(fq.to_ascii_lowercase()) {
            out.referenced.push(fq.clone());
        }
        if from_position && !out.from_tables.contains(&fq) {
            out.from_tables.push(fq.clone());
        }
        Some(fq)
    };

    let alias = match tokens.get(i) {
        Some(t) if t.is_word("as") => {
            let alias = tokens.get(i + 1).filter(|a| a.is_ident()).ok_or_else(|| {
                TableRefError::Unreadable(format!("missing alias after AS for {}", path))
            })?;
            i += 2;
            Some(alias.text.as_str())
        }
        Some(t) if t.is_ident() && !is_clause_word(t) => {
            i += 1;
            Some(t.text.as_str())
        }
        _ => None,
    };

    if let (Some(alias), Some(table)) = (alias, table) {
        out.aliases.insert(alias.to_ascii_lowercase(), table);
    }

    Ok(i)
}

/// Read a dotted path like `proj-x.ds.t` or `` `proj.ds.t` ``. Returns the
/// joined path, its dot-separated parts and the next index.
fn read_path(tokens: &[Token], start: usize) -> (String, Vec<String>, usize) {
    let mut path = String::new();
    let mut i = start;
    let mut expect_ident = true;

    while let Some(tok) = tokens.get(i) {
        let adjacent = i == start || !tok.spaced;
        if expect_ident && tok.is_ident() && adjacent {
            path.push_str(&tok.text);
            expect_ident = false;
        } else if !expect_ident && adjacent && (tok.is_punct(".") || tok.is_punct("-")) {
            path.push_str(&tok.text);
            expect_ident = true;
        } else if expect_ident && adjacent && tok.kind == TokenKind::Number && path.ends_with('-') {
            // project ids may contain digits after a dash; `42.` keeps its dot
            path.push_str(&tok.text);
            expect_ident = tok.text.ends_with('.');
        } else {
            break;
        }
        i += 1;
    }

    let parts = path
        .split('.')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    (path, parts, i)
}

fn is_clause_word(tok: &Token) -> bool {
    tok.kind == TokenKind::Word && CLAUSE_WORDS.iter().any(|w| tok.text.eq_ignore_ascii_case(w))
}

/// Names defined as `name AS (` in a WITH clause
fn cte_names(tokens: &[Token]) -> HashSet<String> {
    tokens
        .windows(3)
        .filter(|w| w[0].is_ident() && !is_clause_word(&w[0]) && w[1].is_word("as") && w[2].is_punct("("))
        .map(|w| w[0].text.to_ascii_lowercase())
        .collect()
}
