//! Built-in rules for `thelook_ecommerce`.

use crate::metrics::MetricDictionary;
use crate::semantic::rules::{JoinSpec, SemanticRule, SemanticRules};

const GUIDANCE: &[&str] = &[
    "If the user says \"active buyers\" / \"buyers\" / \"purchasers\": use ORDERS-based active buyers = COUNT(DISTINCT o.user_id).",
    "If the user says \"active users\" / \"MAU\" / \"DAU\" / \"engaged users\" and does NOT mention buyers/purchasers/orders: use EVENTS-based active users = COUNT(DISTINCT e.user_id).",
    "If the user only says \"active\" without buyers/users: assume active buyers (orders-based).",
    "Never use users.created_at as the date for \"active buyers\" or \"orders\".",
    "For GMV + Orders + AOV by month: compute each metric in its own monthly CTE from its fact table, then join the CTEs with explicit ON (a.month = b.month).",
];

/// Table rules, one metric rule per dictionary entry, and the logical join keys.
pub fn thelook_rules(metrics: &MetricDictionary) -> SemanticRules {
    let mut rules = vec![
        SemanticRule::for_table("order_items", "created_at"),
        SemanticRule::for_table("orders", "created_at"),
        SemanticRule::for_table("users", "created_at"),
        SemanticRule::for_table("events", "created_at"),
    ];
    rules.extend(
        metrics
            .metrics()
            .iter()
            .map(|m| SemanticRule::for_metric(&m.name, &m.source_table, &m.time_field)),
    );

    SemanticRules::new(
        rules,
        vec![
            JoinSpec::new("orders", "order_items", "orders.order_id = order_items.order_id"),
            JoinSpec::new("orders", "users", "orders.user_id = users.id"),
            JoinSpec::new("order_items", "products", "order_items.product_id = products.id"),
        ],
    )
    .with_guidance(GUIDANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::thelook_metrics;
    use crate::semantic::RuleKey;

    #[test]
    fn test_metric_rules_follow_dictionary() {
        let rules = thelook_rules(&thelook_metrics());
        let gmv = rules.rules_for(&RuleKey::Metric("gmv".into())).unwrap();
        assert_eq!(gmv.canonical_fact_table.as_deref(), Some("order_items"));
        let buyers = rules.rules_for(&RuleKey::Metric("ACTIVE_BUYERS".into())).unwrap();
        assert_eq!(buyers.canonical_fact_table.as_deref(), Some("orders"));
    }

    #[test]
    fn test_prompt_hints() {
        let hints = thelook_rules(&thelook_metrics()).render_prompt_hints("bigquery-public-data.thelook_ecommerce");
        assert!(hints.starts_with("SEMANTIC RULES (follow strictly):"));
        assert!(hints.contains("- GMV, AOV: use `order_items` and DATE(order_items.created_at)."));
        assert!(hints.contains("- orders.user_id = users.id"));
        assert!(hints.contains("DISAMBIGUATION RULES"));
    }
}
