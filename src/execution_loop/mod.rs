pub mod error_classifier;
pub mod outcome;
pub mod prompt;
pub mod repair;
pub mod row_cap;
pub mod runner;

pub use error_classifier::*;
pub use outcome::*;
pub use prompt::*;
pub use repair::*;
pub use row_cap::*;
pub use runner::*;
