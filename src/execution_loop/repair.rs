//! Error Recovery
//!
//! Builds the single repair request sent after a warehouse error.

use crate::execution_loop::error_classifier::ErrorClassifier;
use crate::execution_loop::prompt::PromptContext;
use crate::llm::RepairRequest;

pub struct ErrorRecovery {
    classifier: ErrorClassifier,
}

impl ErrorRecovery {
    pub fn new() -> Self {
        Self {
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn build_repair_request(&self, context: &PromptContext, failed_sql: &str, error: &str) -> RepairRequest {
        let class = self.classifier.classify(error);
        let instructions = format!(
            "{}\n\nERROR CLASS: {}\n- {}",
            context.repair_instructions(),
            class,
            class.repair_hint()
        );

        RepairRequest {
            instructions,
            question: context.question.clone(),
            failed_sql: failed_sql.to_string(),
            error: error.to_string(),
        }
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PromptContext {
        PromptContext {
            question: "orders last week".to_string(),
            allowed_tables: vec!["p.d.orders".to_string()],
            schema_context: "SCHEMA".to_string(),
            metrics_block: String::new(),
            semantic_hints: "SEMANTIC RULES".to_string(),
            output_hints: String::new(),
            active_users_events: false,
            row_cap: 100,
        }
    }

    #[test]
    fn test_repair_request_includes_classified_hint() {
        let recovery = ErrorRecovery::new();
        let request = recovery.build_repair_request(
            &context(),
            "SELECT order_date FROM `p.d.orders`",
            "Unrecognized name: order_date at [1:8]",
        );
        assert!(request.instructions.contains("ERROR CLASS: ColumnNotFound"));
        assert!(request.instructions.contains("Use only columns listed in the SCHEMA block"));
        assert_eq!(request.question, "orders last week");
        assert_eq!(request.failed_sql, "SELECT order_date FROM `p.d.orders`");
    }
}
