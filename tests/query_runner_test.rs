mod common;

use common::{one_row, runner_with, settings, FakeWarehouse, ScriptedGenerator};
use guarded_sql::execution_loop::{ExecutionOutcome, RunState, RunnerSettings};
use guarded_sql::guard::GuardReason;
use guarded_sql::semantic::ViolationKind;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

const ORDERS_SQL: &str = "SELECT COUNT(DISTINCT o.order_id) AS orders \
                          FROM `proj.shop.orders` o \
                          WHERE DATE(o.created_at) >= DATE_SUB(CURRENT_DATE(), INTERVAL 30 DAY)";

#[tokio::test]
async fn test_successful_run() {
    let warehouse = Arc::new(FakeWarehouse::new());
    {
        let mut script = warehouse.execute_script.lock().unwrap();
        script.push_back(Ok(one_row("orders", json!(1234))));
    }
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL));
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::clone(&generator));

    let report = runner.run("How many orders last month?").await.unwrap();

    assert!(report.outcome.is_success(), "{}", report.outcome.summary());
    assert_eq!(report.state, RunState::Executed);
    assert_eq!(report.repairs_used, 0);
    assert_eq!(report.matched_metrics.first().map(String::as_str), Some("ORDERS"));
    assert!(report.violations.is_empty());
    assert_eq!(report.dry_run.unwrap().estimated_bytes, 1_000);
    assert_eq!(warehouse.dry_runs(), 1);
    assert_eq!(warehouse.executions(), 1);
    assert_eq!(
        report.trace.states(),
        vec![RunState::Generated, RunState::Guarded, RunState::DryRun, RunState::Executed]
    );
}

#[tokio::test]
async fn test_scan_over_cap_is_blocked_before_execution() {
    let warehouse = Arc::new(FakeWarehouse::new().with_estimate(1_500_000));
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL));
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::clone(&generator));

    let report = runner.run("How many orders last month?").await.unwrap();

    match &report.outcome {
        ExecutionOutcome::Blocked { estimated_bytes, reason } => {
            assert_eq!(*estimated_bytes, 1_500_000);
            assert!(reason.contains("1000000"));
        }
        other => panic!("expected Blocked, got {:?}", other),
    }
    assert_eq!(report.state, RunState::Blocked);
    assert_eq!(warehouse.executions(), 0);
    assert_eq!(generator.repairs(), 0);
}

#[tokio::test]
async fn test_estimate_equal_to_cap_is_allowed() {
    let warehouse = Arc::new(FakeWarehouse::new().with_estimate(1_000_000));
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL));
    let runner = runner_with(settings(), Arc::clone(&warehouse), generator);

    let report = runner.run("How many orders last month?").await.unwrap();
    assert!(report.outcome.is_success());
    assert_eq!(warehouse.executions(), 1);
}

#[tokio::test]
async fn test_persistent_warehouse_error_uses_single_repair() {
    let warehouse = Arc::new(FakeWarehouse::new().with_execute_errors(&[
        "Unrecognized name: order_total at [1:8]",
        "Unrecognized name: order_total at [1:8]",
        "Unrecognized name: order_total at [1:8]",
    ]));
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL));
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::clone(&generator));

    let report = runner.run("How many orders last month?").await.unwrap();

    match &report.outcome {
        ExecutionOutcome::WarehouseError { message } => assert!(message.contains("order_total")),
        other => panic!("expected WarehouseError, got {:?}", other),
    }
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.repairs_used, 1);
    assert_eq!(generator.repairs(), 1);
    assert_eq!(warehouse.executions(), 2);

    let requests = generator.repair_requests.lock().unwrap();
    assert!(requests[0].error.contains("Unrecognized name"));
    assert!(requests[0].failed_sql.contains("COUNT(DISTINCT o.order_id)"));
}

#[tokio::test]
async fn test_repair_budget_zero_disables_repair() {
    let warehouse = Arc::new(FakeWarehouse::new().with_execute_errors(&["Syntax error: Unexpected end of script"]));
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL));
    let runner = runner_with(
        RunnerSettings {
            max_repair_attempts: 0,
            ..settings()
        },
        Arc::clone(&warehouse),
        Arc::clone(&generator),
    );

    let report = runner.run("How many orders last month?").await.unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::WarehouseError { .. }));
    assert_eq!(generator.repairs(), 0);
    assert_eq!(report.repairs_used, 0);
}

#[tokio::test]
async fn test_repair_recovers_from_warehouse_error() {
    let fixed = "SELECT COUNT(DISTINCT order_id) AS orders FROM `proj.shop.orders` \
                 WHERE DATE(created_at) >= '2024-05-01'";
    let warehouse = Arc::new(FakeWarehouse::new().with_execute_errors(&[
        "No matching signature for operator >= for argument types: TIMESTAMP, DATE",
    ]));
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL).with_repair(fixed));
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::clone(&generator));

    let report = runner.run("How many orders last month?").await.unwrap();

    assert!(report.outcome.is_success(), "{}", report.outcome.summary());
    assert_eq!(report.repairs_used, 1);
    assert_eq!(report.final_sql.as_deref(), Some(fixed));
    assert_eq!(warehouse.executed_sql().last().map(String::as_str), Some(fixed));
    assert!(report.trace.states().contains(&RunState::Repaired));

    let requests = generator.repair_requests.lock().unwrap();
    assert!(requests[0].instructions.contains("ERROR CLASS"));
}

#[tokio::test]
async fn test_dry_run_error_is_repairable() {
    let warehouse = Arc::new(FakeWarehouse::new().with_dry_run_error("Unrecognized name: revenue_total"));
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL).with_repair(ORDERS_SQL));
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::clone(&generator));

    let report = runner.run("How many orders last month?").await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(generator.repairs(), 1);
    assert_eq!(warehouse.dry_runs(), 2);
    assert_eq!(warehouse.executions(), 1);
}

#[tokio::test]
async fn test_guard_rejection_is_never_repaired() {
    let warehouse = Arc::new(FakeWarehouse::new());
    let generator = Arc::new(ScriptedGenerator::new("DELETE FROM `proj.shop.orders` WHERE TRUE"));
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::clone(&generator));

    let report = runner.run("Remove all orders").await.unwrap();

    assert!(matches!(report.outcome, ExecutionOutcome::GuardRejected(_)));
    assert_eq!(report.state, RunState::Rejected);
    assert_eq!(generator.repairs(), 0);
    assert_eq!(warehouse.dry_runs(), 0);
    assert_eq!(warehouse.executions(), 0);
}

#[tokio::test]
async fn test_table_outside_override_is_rejected() {
    let warehouse = Arc::new(FakeWarehouse::new());
    let generator = Arc::new(ScriptedGenerator::new(
        "SELECT COUNT(*) AS new_users FROM `proj.shop.users`",
    ));
    let override_tables: BTreeSet<String> = ["orders", "ghost_table"].iter().map(|s| s.to_string()).collect();
    let runner = runner_with(
        RunnerSettings {
            allowlist_override: Some(override_tables),
            ..settings()
        },
        Arc::clone(&warehouse),
        generator,
    );

    let report = runner.run("How many users signed up?").await.unwrap();

    match &report.outcome {
        ExecutionOutcome::GuardRejected(rejection) => {
            assert_eq!(rejection.kind, GuardReason::TableNotAllowed);
            assert!(rejection.message.contains("users"));
        }
        other => panic!("expected GuardRejected, got {:?}", other),
    }
    assert!(report.warnings.iter().any(|w| w.contains("ghost_table")));
    assert_eq!(warehouse.executions(), 0);
}

const REVENUE_ON_SHIPPED_AT: &str = "SELECT SUM(oi.sale_price) AS gmv \
                                     FROM `proj.shop.order_items` oi \
                                     WHERE DATE(oi.shipped_at) >= '2024-05-01'";

#[tokio::test]
async fn test_wrong_time_field_is_advisory_by_default() {
    let warehouse = Arc::new(FakeWarehouse::new());
    let generator = Arc::new(ScriptedGenerator::new(REVENUE_ON_SHIPPED_AT));
    let runner = runner_with(settings(), Arc::clone(&warehouse), generator);

    let report = runner.run("What was revenue last month?").await.unwrap();

    assert!(report.outcome.is_success());
    assert_eq!(report.matched_metrics.first().map(String::as_str), Some("GMV"));
    assert!(report
        .violations
        .iter()
        .any(|v| v.kind == ViolationKind::WrongTimeField && v.message.contains("created_at")));
    assert!(report.warnings.iter().any(|w| w.starts_with("Semantic rule:")));
    assert!(report.assumptions.iter().any(|a| a.contains("GMV")));
    assert_eq!(warehouse.executions(), 1);
}

#[tokio::test]
async fn test_wrong_time_field_rejected_when_enforced() {
    let warehouse = Arc::new(FakeWarehouse::new());
    let generator = Arc::new(ScriptedGenerator::new(REVENUE_ON_SHIPPED_AT));
    let runner = runner_with(
        RunnerSettings {
            enforce_semantic_rules: true,
            ..settings()
        },
        Arc::clone(&warehouse),
        Arc::clone(&generator),
    );

    let report = runner.run("What was revenue last month?").await.unwrap();

    match &report.outcome {
        ExecutionOutcome::SemanticRejected(violations) => {
            assert!(violations.iter().any(|v| v.kind == ViolationKind::WrongTimeField));
        }
        other => panic!("expected SemanticRejected, got {:?}", other),
    }
    assert_eq!(report.state, RunState::Rejected);
    assert_eq!(warehouse.dry_runs(), 0);
    assert_eq!(generator.repairs(), 0);
}

#[tokio::test]
async fn test_generation_failure_is_reported() {
    let warehouse = Arc::new(FakeWarehouse::new());
    let generator = Arc::new(ScriptedGenerator::failing("model returned no SQL"));
    let runner = runner_with(settings(), Arc::clone(&warehouse), generator);

    let report = runner.run("How many orders last month?").await.unwrap();

    match &report.outcome {
        ExecutionOutcome::GenerationFailed { message } => assert!(message.contains("no SQL")),
        other => panic!("expected GenerationFailed, got {:?}", other),
    }
    assert_eq!(report.state, RunState::Failed);
    assert!(report.final_sql.is_none());
    assert_eq!(warehouse.dry_runs(), 0);
}

#[tokio::test]
async fn test_row_cap_added_to_grouped_query() {
    let grouped = "SELECT DATE(o.created_at) AS day, COUNT(DISTINCT o.order_id) AS orders \
                   FROM `proj.shop.orders` o GROUP BY day ORDER BY day";
    let warehouse = Arc::new(FakeWarehouse::new());
    let generator = Arc::new(ScriptedGenerator::new(grouped));
    let runner = runner_with(settings(), Arc::clone(&warehouse), generator);

    let report = runner.run("Daily orders").await.unwrap();

    assert!(report.outcome.is_success());
    let executed = warehouse.executed_sql();
    assert!(executed[0].ends_with("LIMIT 200"));
}

#[tokio::test]
async fn test_schema_unavailable_is_an_error() {
    let warehouse = Arc::new(FakeWarehouse::new());
    warehouse.fail_fetch.store(true, std::sync::atomic::Ordering::SeqCst);
    let generator = Arc::new(ScriptedGenerator::new(ORDERS_SQL));
    let runner = runner_with(settings(), warehouse, Arc::clone(&generator));

    assert!(runner.run("How many orders?").await.is_err());
    assert_eq!(generator.generate_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_check_reports_guard_and_semantic_findings() {
    let warehouse = Arc::new(FakeWarehouse::new());
    let runner = runner_with(settings(), Arc::clone(&warehouse), Arc::new(ScriptedGenerator::new("")));

    let rejected = runner.check("SELECT * FROM `proj.shop.orders`; DROP TABLE x").await.unwrap();
    assert!(!rejected.verdict.passed);
    assert!(rejected.verdict.normalized_sql.is_none());

    let advisory = runner.check(REVENUE_ON_SHIPPED_AT).await.unwrap();
    assert!(advisory.verdict.passed);
    assert!(advisory
        .violations
        .iter()
        .any(|v| v.kind == ViolationKind::WrongTimeField));
    assert_eq!(warehouse.dry_runs(), 0);
}
