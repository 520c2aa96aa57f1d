pub mod builtin;
pub mod cards;
pub mod dictionary;

pub use builtin::*;
pub use cards::*;
pub use dictionary::*;
