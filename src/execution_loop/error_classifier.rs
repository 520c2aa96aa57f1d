//! Error Classifier
//!
//! Sorts warehouse error messages into a small taxonomy so the repair prompt
//! can say what kind of fix is needed.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarehouseErrorClass {
    ColumnNotFound,
    TableNotFound,
    TypeMismatch,
    InvalidAggregation,
    SyntaxError,
    AccessDenied,
    ResourceExceeded,
    Timeout,
    Other(String),
}

impl fmt::Display for WarehouseErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarehouseErrorClass::ColumnNotFound => write!(f, "ColumnNotFound"),
            WarehouseErrorClass::TableNotFound => write!(f, "TableNotFound"),
            WarehouseErrorClass::TypeMismatch => write!(f, "TypeMismatch"),
            WarehouseErrorClass::InvalidAggregation => write!(f, "InvalidAggregation"),
            WarehouseErrorClass::SyntaxError => write!(f, "SyntaxError"),
            WarehouseErrorClass::AccessDenied => write!(f, "AccessDenied"),
            WarehouseErrorClass::ResourceExceeded => write!(f, "ResourceExceeded"),
            WarehouseErrorClass::Timeout => write!(f, "Timeout"),
            WarehouseErrorClass::Other(msg) => write!(f, "Other({})", msg),
        }
    }
}

impl WarehouseErrorClass {
    /// One-line instruction added to the repair prompt
    pub fn repair_hint(&self) -> &'static str {
        match self {
            WarehouseErrorClass::ColumnNotFound => {
                "A referenced column does not exist. Use only columns listed in the SCHEMA block."
            }
            WarehouseErrorClass::TableNotFound => {
                "A referenced table does not exist. Use only the allowed tables, fully qualified with backticks."
            }
            WarehouseErrorClass::TypeMismatch => {
                "Operand types do not match. Cast explicitly, e.g. compare DATE(ts) with DATE values."
            }
            WarehouseErrorClass::InvalidAggregation => {
                "Every non-aggregated SELECT column must appear in GROUP BY; do not nest aggregates."
            }
            WarehouseErrorClass::SyntaxError => {
                "The query is not valid BigQuery Standard SQL. Fix the syntax and keep the same intent."
            }
            WarehouseErrorClass::AccessDenied => {
                "Access was denied. Only query tables from the allowed dataset."
            }
            WarehouseErrorClass::ResourceExceeded => {
                "The query used too many resources. Filter earlier and aggregate before joining."
            }
            WarehouseErrorClass::Timeout => {
                "The query timed out. Narrow the date range or aggregate before joining."
            }
            WarehouseErrorClass::Other(_) => "Fix the error and keep the same intent.",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, message: &str) -> WarehouseErrorClass {
        let msg = message.to_lowercase();

        if msg.contains("unrecognized name") || (msg.contains("name") && msg.contains("not found inside"))
            || (msg.contains("column") && (msg.contains("not found") || msg.contains("does not exist")))
        {
            return WarehouseErrorClass::ColumnNotFound;
        }

        if msg.contains("not found: table") || msg.contains("not found: dataset")
            || (msg.contains("table") && (msg.contains("not found") || msg.contains("does not exist")))
        {
            return WarehouseErrorClass::TableNotFound;
        }

        if msg.contains("no matching signature") || msg.contains("cannot be compared") || msg.contains("type mismatch") {
            return WarehouseErrorClass::TypeMismatch;
        }

        if msg.contains("neither grouped nor aggregated") || msg.contains("aggregations of aggregations") {
            return WarehouseErrorClass::InvalidAggregation;
        }

        if msg.contains("syntax error") || msg.contains("unexpected keyword") || msg.contains("expected end of input") {
            return WarehouseErrorClass::SyntaxError;
        }

        if msg.contains("access denied") || msg.contains("permission") {
            return WarehouseErrorClass::AccessDenied;
        }

        if msg.contains("resources exceeded") || msg.contains("quota") {
            return WarehouseErrorClass::ResourceExceeded;
        }

        if msg.contains("timed out") || msg.contains("timeout") || msg.contains("did not complete") {
            return WarehouseErrorClass::Timeout;
        }

        WarehouseErrorClass::Other(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unrecognized_name() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("Unrecognized name: order_date at [1:45]"),
            WarehouseErrorClass::ColumnNotFound
        );
    }

    #[test]
    fn test_classify_table_and_syntax() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("Not found: Table proj:ds.ordr was not found in location US"),
            WarehouseErrorClass::TableNotFound
        );
        assert_eq!(
            classifier.classify("Syntax error: Expected end of input but got keyword FROM"),
            WarehouseErrorClass::SyntaxError
        );
        assert_eq!(
            classifier.classify("SELECT list expression references column x which is neither grouped nor aggregated"),
            WarehouseErrorClass::InvalidAggregation
        );
    }

    #[test]
    fn test_classify_other() {
        let classifier = ErrorClassifier::new();
        assert!(matches!(classifier.classify("boom"), WarehouseErrorClass::Other(_)));
    }
}
