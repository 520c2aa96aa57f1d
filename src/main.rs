use guarded_sql::assumptions::infer_assumptions;
use guarded_sql::execution_loop::{ExecutionOutcome, QueryRunner, RunReport, RunnerSettings};
use guarded_sql::llm::LlmClient;
use guarded_sql::metrics::{render_metric_cards, thelook_metrics};
use guarded_sql::schema_cache::{build_allowlist, JsonFileStore, SchemaCache, SystemClock};
use guarded_sql::semantic::thelook_rules;
use guarded_sql::warehouse::BigQueryClient;
use guarded_sql::Config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "guarded-sql")]
#[command(about = "Natural-language questions to validated, cost-capped BigQuery SQL")]
#[command(version)]
struct Args {
    /// Dataset as `project.dataset` (or set GSQL_DATASET)
    #[arg(long, global = true)]
    dataset: Option<String>,

    /// Maximum dry-run estimate in bytes (or set GSQL_SCAN_CAP_BYTES)
    #[arg(long, global = true)]
    scan_cap_bytes: Option<u64>,

    /// Schema cache directory (or set GSQL_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Reject queries that break semantic rules instead of warning
    #[arg(long, global = true)]
    enforce_semantics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, validate and run SQL for a question
    Ask {
        question: String,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the cached schema, optionally forcing a refresh
    Schema {
        #[arg(long)]
        refresh: bool,
    },
    /// Run the guard and semantic rules on a SQL string
    Check { sql: String },
    /// Show matched metrics, metric cards and assumptions for a question
    Explain { question: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Commands::Ask { question, json } => ask(&config, &question, json).await,
        Commands::Schema { refresh } => schema(&config, refresh).await,
        Commands::Check { sql } => check(&config, &sql).await,
        Commands::Explain { question } => {
            explain(&question);
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(dataset) = &args.dataset {
        config.dataset = dataset.clone();
    }
    if let Some(cap) = args.scan_cap_bytes {
        config.scan_cap_bytes = cap;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    if args.enforce_semantics {
        config.enforce_semantic_rules = true;
    }
    Ok(config.validate()?)
}

fn schema_cache(config: &Config, warehouse: Arc<BigQueryClient>) -> Arc<SchemaCache> {
    Arc::new(
        SchemaCache::new(
            config.dataset.clone(),
            config.cache_ttl(),
            warehouse,
            Arc::new(JsonFileStore::new(&config.cache_dir)),
            Arc::new(SystemClock),
        )
        .with_fetch_timeout(config.warehouse_timeout()),
    )
}

fn build_runner(config: &Config, with_generator: bool) -> Result<QueryRunner> {
    let warehouse = Arc::new(BigQueryClient::from_env(&config.location, config.warehouse_timeout())?);
    let metrics = Arc::new(thelook_metrics());
    let rules = Arc::new(thelook_rules(&metrics));

    let generator: Arc<dyn guarded_sql::llm::GenerationClient> = if with_generator {
        Arc::new(LlmClient::from_env(
            &config.default_model,
            &config.fallback_model,
            config.generation_timeout(),
        )?)
    } else {
        Arc::new(NoGeneration)
    };

    Ok(QueryRunner::new(
        RunnerSettings::from_config(config),
        schema_cache(config, Arc::clone(&warehouse)),
        metrics,
        rules,
        warehouse,
        generator,
    ))
}

/// Stand-in for commands that never generate SQL
struct NoGeneration;

#[async_trait::async_trait]
impl guarded_sql::llm::GenerationClient for NoGeneration {
    fn name(&self) -> &str {
        "none"
    }

    async fn generate(&self, _prompt: &guarded_sql::llm::Prompt) -> guarded_sql::Result<String> {
        Err(guarded_sql::AgentError::Generation("generation is disabled for this command".to_string()))
    }

    async fn repair(&self, _request: &guarded_sql::llm::RepairRequest) -> guarded_sql::Result<String> {
        Err(guarded_sql::AgentError::Generation("generation is disabled for this command".to_string()))
    }
}

async fn ask(config: &Config, question: &str, json: bool) -> Result<()> {
    let runner = build_runner(config, true)?;
    let report = runner.run(question).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    if !report.assumptions.is_empty() {
        println!("Assumptions:");
        for a in &report.assumptions {
            println!("  - {}", a);
        }
    }
    for w in &report.warnings {
        println!("Warning: {}", w);
    }
    if let Some(sql) = &report.final_sql {
        println!("\nSQL:\n{}\n", sql);
    }
    if let Some(dry_run) = &report.dry_run {
        println!("Estimated bytes: {}", dry_run.estimated_bytes);
    }
    if report.repairs_used > 0 {
        println!("Repairs used: {}", report.repairs_used);
    }

    if let ExecutionOutcome::Success { columns, rows, .. } = &report.outcome {
        println!("{}", columns.join("\t"));
        for row in rows {
            let cells: Vec<String> = columns
                .iter()
                .map(|c| row.get(c).map(|v| v.to_string()).unwrap_or_default())
                .collect();
            println!("{}", cells.join("\t"));
        }
    }
    println!("\n{}", report.outcome.summary());
}

async fn schema(config: &Config, refresh: bool) -> Result<()> {
    let warehouse = Arc::new(BigQueryClient::from_env(&config.location, config.warehouse_timeout())?);
    let cache = schema_cache(config, warehouse);
    let snapshot = cache.get_schema(refresh).await?;
    if let Some(warning) = snapshot.warning() {
        println!("Warning: {}", warning);
    }

    let allowlist = build_allowlist(&snapshot.entry, config.allowlist_override.as_ref());
    info!("Schema source: {:?}", snapshot.source);
    println!(
        "{} ({} tables, fetched at {})",
        snapshot.entry.dataset,
        snapshot.entry.tables.len(),
        snapshot.entry.fetched_at
    );
    for table in snapshot.entry.tables.values() {
        let marker = if allowlist.contains(&table.table) { "" } else { " (not allowlisted)" };
        println!("- {}{}: {} columns", table.table, marker, table.columns.len());
    }
    Ok(())
}

async fn check(config: &Config, sql: &str) -> Result<()> {
    let runner = build_runner(config, false)?;
    let report = runner.check(sql).await?;

    for w in &report.warnings {
        println!("Warning: {}", w);
    }
    match (&report.verdict.normalized_sql, &report.verdict.reason) {
        (Some(normalized), _) => println!("PASSED\n{}", normalized),
        (None, Some(reason)) => println!("REJECTED {}", reason),
        (None, None) => println!("REJECTED"),
    }
    for v in &report.violations {
        println!("Semantic: {}", v);
    }
    Ok(())
}

fn explain(question: &str) {
    let metrics = thelook_metrics();
    let matched = metrics.match_metrics(question);

    println!("Matched metrics:");
    if matched.is_empty() {
        println!("  (none)");
    }
    for m in &matched {
        println!("  - {}", m.name);
    }

    let cards = render_metric_cards(question, &matched);
    if !cards.is_empty() {
        println!("\n{}", cards);
    }

    println!("\nAssumptions:");
    for a in infer_assumptions(question) {
        println!("  - {}", a);
    }
}
