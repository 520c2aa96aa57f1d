//! Assumptions Inference
//!
//! Reads the question for ambiguous terms and reports how they were
//! interpreted. Shown to the user; never changes the SQL.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ACTIVE_USERS: Regex =
        Regex::new(r"\b(active users|monthly active users|daily active users|mau|dau|engaged users)\b").unwrap();
    static ref BUYER_WORDS: Regex = Regex::new(r"\b(buyers?|purchasers?|purchases?)\b").unwrap();
    static ref ORDER_WORDS: Regex = Regex::new(r"\borders?\b").unwrap();
    static ref ACTIVE: Regex = Regex::new(r"\bactive\b").unwrap();
    static ref REVENUE: Regex = Regex::new(r"\b(revenue|sales)\b").unwrap();
    static ref GMV: Regex = Regex::new(r"\b(gmv|gross merchandise value|gross sales)\b").unwrap();
    static ref NET: Regex =
        Regex::new(r"\b(net|refunds?|returns?|returned|canceled|cancelled|profit|margin)\b").unwrap();
    static ref MOM: Regex = Regex::new(r"\b(mom|month-over-month|month over month|growth)\b").unwrap();
    static ref MONTHLY: Regex = Regex::new(r"\b(by month|monthly|per month|each month)\b").unwrap();
    static ref YEAR: Regex = Regex::new(r"\b(19|20)\d{2}\b").unwrap();
    static ref DATE_HINT: Regex = Regex::new(
        r"\b(between|from|to|since|after|before|ytd|mtd|q[1-4]|last|past|previous|this|today|yesterday)\b"
    )
    .unwrap();
    static ref GRAIN: Regex =
        Regex::new(r"\b(daily|weekly|monthly|quarterly|yearly|annual|by (day|week|month|quarter|year)|per (day|week|month|quarter|year))\b")
            .unwrap();
}

fn lower(question: &str) -> String {
    question.trim().to_lowercase()
}

pub fn wants_monthly(question: &str) -> bool {
    MONTHLY.is_match(&lower(question))
}

pub fn wants_mom(question: &str) -> bool {
    MOM.is_match(&lower(question))
}

/// "active users" / MAU / DAU without buyer wording means the events-based
/// definition.
pub fn wants_active_users_events(question: &str) -> bool {
    let q = lower(question);
    ACTIVE_USERS.is_match(&q) && !BUYER_WORDS.is_match(&q)
}

pub fn infer_assumptions(question: &str) -> Vec<String> {
    let q = lower(question);
    let mut out: Vec<String> = Vec::new();

    let has_active_users = ACTIVE_USERS.is_match(&q);
    let has_buyers = BUYER_WORDS.is_match(&q);
    let has_orders = ORDER_WORDS.is_match(&q);

    if has_active_users && !has_buyers && !has_orders {
        out.push(
            "Interpreting 'active users/MAU/DAU' as EVENTS-based active users (distinct events.user_id)."
                .to_string(),
        );
    }
    if ACTIVE.is_match(&q) && !has_active_users && !has_buyers && !has_orders {
        out.push(
            "Term 'active' is ambiguous. Defaulting to ACTIVE BUYERS (orders-based: distinct orders.user_id)."
                .to_string(),
        );
    }

    if REVENUE.is_match(&q) && !NET.is_match(&q) && !GMV.is_match(&q) {
        out.push(
            "Interpreting 'revenue/sales' as GMV (booked sales); refunds and returns are not netted out."
                .to_string(),
        );
    }

    if MOM.is_match(&q) {
        out.push("MoM growth uses SAFE_DIVIDE(x - LAG(x), LAG(x)) with LAG over ORDER BY month.".to_string());
    }

    if !YEAR.is_match(&q) && !DATE_HINT.is_match(&q) {
        out.push(
            "No explicit date range provided; the query may use all available data or an inferred default window."
                .to_string(),
        );
    }

    if !GRAIN.is_match(&q) && !MOM.is_match(&q) {
        out.push("No time grain requested; results are aggregated over the whole period.".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    out.retain(|a| seen.insert(a.clone()));
    out
}
