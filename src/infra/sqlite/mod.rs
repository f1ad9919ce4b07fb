//! SQLite implementation for single-node and embedded deployments
//!
//! SQLite has no row locks, so exclusion is optimistic: a compare-and-swap on
//! the row's `version` column, retried until the lock budget runs out.

mod sequence_store;

pub use sequence_store::*;
