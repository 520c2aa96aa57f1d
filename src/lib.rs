pub mod assumptions;
pub mod config;
pub mod error;
pub mod execution_loop;
pub mod guard;
pub mod llm;
pub mod metrics;
pub mod schema_cache;
pub mod semantic;
pub mod warehouse;

pub use config::Config;
pub use error::{AgentError, Result};
pub use execution_loop::{ExecutionOutcome, QueryRunner, RunReport, RunnerSettings};
pub use guard::{GuardVerdict, SqlGuard};
