//! Human-readable metric cards shown next to an answer.

use crate::assumptions::wants_mom;
use crate::metrics::dictionary::MetricDefinition;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCard {
    pub name: String,
    pub definition: String,
    pub time_field: String,
    pub formula: String,
}

impl MetricCard {
    pub fn from_metric(metric: &MetricDefinition) -> Self {
        let formula = match &metric.qualification {
            Some(q) => {
                let alias = &metric.table_alias;
                format!(
                    "COUNT of {} where {} {} {}",
                    q.entity_key.replace("{f}", alias),
                    q.qualifying_expr.replace("{f}", alias),
                    q.threshold_op,
                    q.threshold_value
                )
            }
            None => metric.aliased_formula(),
        };
        Self {
            name: metric.name.clone(),
            definition: metric.definition.clone(),
            time_field: format!("{}.{}", metric.source_table_short(), metric.time_field),
            formula,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "Metric Name: {}\nDefinition: {}\nTime field: {}\nFormula: {}",
            self.name, self.definition, self.time_field, self.formula
        )
    }
}

fn mom_card() -> MetricCard {
    MetricCard {
        name: "MoM growth".to_string(),
        definition: "Month-over-month growth of the base metric.".to_string(),
        time_field: "calendar month of the base metric's time field".to_string(),
        formula: "SAFE_DIVIDE(curr - prev, prev), prev = LAG(value) OVER (ORDER BY month)".to_string(),
    }
}

/// Cards for the matched metrics, plus a growth card when the question asks
/// for month-over-month.
pub fn metric_cards(question: &str, matches: &[&MetricDefinition]) -> Vec<MetricCard> {
    let mut cards: Vec<MetricCard> = matches.iter().map(|m| MetricCard::from_metric(m)).collect();
    if wants_mom(question) && !matches.is_empty() {
        cards.push(mom_card());
    }
    cards
}

pub fn render_metric_cards(question: &str, matches: &[&MetricDefinition]) -> String {
    metric_cards(question, matches)
        .iter()
        .map(MetricCard::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::builtin::thelook_metrics;

    #[test]
    fn test_card_for_plain_metric() {
        let dict = thelook_metrics();
        let card = MetricCard::from_metric(dict.get("GMV").unwrap());
        assert_eq!(card.time_field, "order_items.created_at");
        assert_eq!(card.formula, "SUM(oi.sale_price)");
        assert!(card.render().starts_with("Metric Name: GMV\n"));
    }

    #[test]
    fn test_mom_question_adds_growth_card() {
        let dict = thelook_metrics();
        let gmv = dict.get("GMV").unwrap();
        let cards = metric_cards("GMV MoM growth for 2024", &[gmv]);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[1].name, "MoM growth");

        let plain = metric_cards("GMV for 2024", &[gmv]);
        assert_eq!(plain.len(), 1);
    }

    #[test]
    fn test_qualified_metric_card_describes_threshold() {
        let dict = thelook_metrics();
        let card = MetricCard::from_metric(dict.get("ACTIVE_BUYERS_3PLUS").unwrap());
        assert_eq!(card.formula, "COUNT of o.user_id where COUNT(DISTINCT o.order_id) >= 3");
    }
}
