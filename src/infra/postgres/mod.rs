//! PostgreSQL implementation for multi-process deployments
//!
//! Exclusion is a pessimistic `SELECT ... FOR UPDATE` on the definition row,
//! so every process sharing the database sees one serial order per key.

mod sequence_store;

pub use sequence_store::*;
