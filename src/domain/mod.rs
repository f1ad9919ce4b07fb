//! Domain models for document number sequences
//!
//! Identifier types plus the immutable sequence definition and the pure
//! rules for rollover and formatting.

mod definition;
mod types;

pub use definition::*;
pub use types::*;
