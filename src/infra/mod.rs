//! Infrastructure layer for the document sequencer
//!
//! Contains trait definitions and implementations for:
//! - Sequence stores (PostgreSQL, SQLite, in-memory)
//! - Allocation (locked read-increment-commit)
//! - Definition administration
//! - Retry with backoff
//! - Graceful shutdown

mod admin;
mod allocator;
mod error;
mod graceful_shutdown;
mod memory;
pub mod postgres;
pub(crate) mod retry;
pub mod sqlite;
mod traits;

pub use admin::DefinitionAdmin;
pub use allocator::{Allocator, AllocatorConfig};
pub use error::*;
pub use graceful_shutdown::shutdown_signal;
pub use memory::MemorySequenceStore;
pub use postgres::PgSequenceStore;
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult};
pub use sqlite::SqliteSequenceStore;
pub use traits::*;
