//! Built-in metric registry for the `thelook_ecommerce` dataset.

use crate::metrics::dictionary::{MetricDefinition, MetricDictionary, Qualification};

pub fn thelook_metrics() -> MetricDictionary {
    MetricDictionary::new(vec![
        MetricDefinition::new(
            "GMV",
            "Gross Merchandise Value (total sales). Default: booked GMV.",
            "SUM({f}.sale_price)",
            "order_items",
            "created_at",
        )
        .with_synonyms(&["gmv", "sales", "revenue", "gross sales", "gross merchandise value"])
        .with_grain("item")
        .with_output_alias("gmv")
        .with_notes(&[
            "Use order_items for money metrics.",
            "Time field for GMV: DATE(order_items.created_at).",
        ]),
        MetricDefinition::new(
            "AOV",
            "Average Order Value = GMV / number of distinct orders.",
            "SAFE_DIVIDE(SUM({f}.sale_price), COUNT(DISTINCT {f}.order_id))",
            "order_items",
            "created_at",
        )
        .with_synonyms(&["aov", "average order value"])
        .with_grain("order")
        .with_output_alias("aov")
        .with_notes(&["Do NOT use AVG(item_price). Use GMV / distinct orders."]),
        MetricDefinition::new(
            "ORDERS",
            "Number of orders placed in the period.",
            "COUNT(DISTINCT {f}.order_id)",
            "orders",
            "created_at",
        )
        .with_synonyms(&["orders", "order count", "number of orders", "how many orders"])
        .with_alias("o")
        .with_grain("order")
        .with_output_alias("orders")
        .with_notes(&["Use orders.created_at for order activity time."]),
        MetricDefinition::new(
            "ACTIVE_BUYERS",
            "Active buyers = users who placed >= 1 order in the period.",
            "COUNT(DISTINCT {f}.user_id)",
            "orders",
            "created_at",
        )
        .with_synonyms(&["active buyers", "purchasing users", "buyers", "purchasers"])
        .with_alias("o")
        .with_grain("user")
        .with_output_alias("active_buyers")
        .with_notes(&["Active buyers uses orders.created_at, NOT users.created_at."]),
        MetricDefinition::new(
            "ACTIVE_USERS",
            "Active users (events-based) = distinct users with >= 1 event in the period (MAU/DAU).",
            "COUNT(DISTINCT {f}.user_id)",
            "events",
            "created_at",
        )
        .with_synonyms(&[
            "active users",
            "monthly active users",
            "mau",
            "daily active users",
            "dau",
            "engaged users",
        ])
        .with_grain("user")
        .with_output_alias("active_users")
        .with_notes(&["Use the events-based definition when the question asks for MAU/DAU/active users."]),
        MetricDefinition::new(
            "NEW_USERS",
            "New users = users created (signed up) in the period.",
            "COUNT(DISTINCT {f}.id)",
            "users",
            "created_at",
        )
        .with_synonyms(&["new users", "signups", "registrations", "signed up"])
        .with_grain("user")
        .with_output_alias("new_users")
        .with_notes(&["Use users.created_at only for signup metrics."]),
        MetricDefinition::new(
            "ACTIVE_BUYERS_3PLUS",
            "Active buyers (3+ orders) = users who placed at least 3 distinct orders in the period.",
            "COUNT(*)",
            "orders",
            "created_at",
        )
        .with_synonyms(&[
            "buyers with 3+ orders",
            "3+ orders",
            "at least 3 orders",
            "three or more orders",
            "repeat buyers 3+",
        ])
        .with_alias("o")
        .with_grain("user")
        .with_output_alias("active_buyers_3plus")
        .with_notes(&["Two-step: per user aggregate -> filter -> count users."])
        .with_qualification(Qualification {
            entity_key: "{f}.user_id".to_string(),
            qualifying_expr: "COUNT(DISTINCT {f}.order_id)".to_string(),
            threshold_op: ">=".to_string(),
            threshold_value: 3,
        }),
    ])
}
