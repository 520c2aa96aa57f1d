//! Schema snapshot types and the pure derivations built from them.

use crate::warehouse::ColumnRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const MAX_PROMPT_TABLES: usize = 30;
const MAX_PROMPT_COLUMNS_PER_TABLE: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Columns of one table, in ordinal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Fully-qualified `project.dataset.table`
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn short_name(&self) -> &str {
        self.table.rsplit('.').next().unwrap_or(&self.table)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Immutable snapshot of the dataset schema. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaCacheEntry {
    pub dataset: String,
    pub tables: BTreeMap<String, TableSchema>,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaCacheEntry {
    /// Group flat metadata rows into per-table schemas. Column order follows
    /// the order the rows arrive in.
    pub fn from_columns(dataset: &str, records: Vec<ColumnRecord>, fetched_at: DateTime<Utc>) -> Self {
        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for record in records {
            let table = qualify_table(dataset, &record.table_name);
            tables
                .entry(table.clone())
                .or_insert_with(|| TableSchema {
                    table,
                    columns: Vec::new(),
                })
                .columns
                .push(ColumnInfo {
                    name: record.column_name,
                    data_type: record.data_type,
                    description: record.description.filter(|d| !d.trim().is_empty()),
                });
        }

        Self {
            dataset: dataset.to_string(),
            tables,
            fetched_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.fetched_at
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.age(now) <= ttl
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .get(name)
            .or_else(|| self.tables.get(&qualify_table(&self.dataset, name)))
    }
}

/// Fully-qualified table names a query may reference, plus the dataset that
/// unqualified references resolve against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowlist {
    dataset: String,
    tables: BTreeSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(dataset: &str, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            dataset: dataset.to_string(),
            tables: tables
                .into_iter()
                .map(|t| qualify_table(dataset, t.as_ref()))
                .collect(),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Qualify a table reference against `project.dataset`. Names that already
/// carry a dataset keep it; one-part names land in the default dataset.
pub fn qualify_table(dataset: &str, table: &str) -> String {
    let table = table.trim().trim_matches('`');
    match table.matches('.').count() {
        0 => format!("{}.{}", dataset, table),
        1 => {
            let project = dataset.split('.').next().unwrap_or(dataset);
            format!("{}.{}", project, table)
        }
        _ => table.to_string(),
    }
}

/// Every cached table is allowlisted. An override narrows the set; it can
/// never add a table the snapshot does not contain.
pub fn build_allowlist(entry: &SchemaCacheEntry, allowlist_override: Option<&BTreeSet<String>>) -> Allowlist {
    let tables: Vec<&String> = match allowlist_override {
        Some(wanted) => {
            let wanted: BTreeSet<String> = wanted
                .iter()
                .map(|t| qualify_table(&entry.dataset, t))
                .collect();
            entry.tables.keys().filter(|t| wanted.contains(*t)).collect()
        }
        None => entry.tables.keys().collect(),
    };
    Allowlist::new(&entry.dataset, tables)
}

/// Override entries that name tables missing from the snapshot.
pub fn unknown_override_tables(entry: &SchemaCacheEntry, allowlist_override: Option<&BTreeSet<String>>) -> Vec<String> {
    allowlist_override
        .map(|wanted| {
            wanted
                .iter()
                .filter(|t| !entry.tables.contains_key(&qualify_table(&entry.dataset, t)))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Compact "table: columns" block used to ground generation in real names.
pub fn build_prompt_context(entry: &SchemaCacheEntry, allowlist: &Allowlist) -> String {
    let mut lines = vec![
        format!("Dataset: {}", entry.dataset),
        "SCHEMA (only use columns listed below; do NOT invent columns):".to_string(),
    ];

    let tables: Vec<&TableSchema> = entry
        .tables
        .values()
        .filter(|t| allowlist.contains(&t.table))
        .collect();

    for table in tables.iter().take(MAX_PROMPT_TABLES) {
        let shown: Vec<String> = table
            .columns
            .iter()
            .take(MAX_PROMPT_COLUMNS_PER_TABLE)
            .map(|c| format!("{}:{}", c.name, c.data_type))
            .collect();
        let suffix = if table.columns.len() > MAX_PROMPT_COLUMNS_PER_TABLE {
            " ... (truncated)"
        } else {
            ""
        };
        lines.push(format!("- `{}` columns: {}{}", table.table, shown.join(", "), suffix));
    }

    if tables.len() > MAX_PROMPT_TABLES {
        lines.push(format!(
            "... ({} more tables omitted)",
            tables.len() - MAX_PROMPT_TABLES
        ));
    }

    lines.join("\n")
}
