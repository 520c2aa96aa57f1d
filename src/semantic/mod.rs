pub mod builtin;
pub mod rules;
pub mod sql_text;
pub mod time_filter;

pub use builtin::*;
pub use rules::*;
pub use sql_text::*;
pub use time_filter::*;
