//! Schema Cache
//!
//! Column metadata for the configured dataset, persisted locally with a TTL.
//! The allowlist and the schema prompt context are derived from it.

pub mod cache;
pub mod clock;
pub mod store;
pub mod types;

pub use cache::*;
pub use clock::*;
pub use store::*;
pub use types::*;
