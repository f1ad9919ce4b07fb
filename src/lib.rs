//! Document Sequencer Library
//!
//! Allocates human-readable, gap-tolerant but never-duplicated document
//! numbers ("INV-0001", "STU-042") per tenant and document type, with
//! optional yearly reset.
//!
//! ## Modules
//!
//! - [`domain`] - Definitions, keys and the pure numbering rules
//! - [`infra`] - Allocator, administration and storage backends (PostgreSQL, SQLite, memory)
//! - [`metrics`] - Allocation counters and latency histograms
//! - [`api`] - REST API routes
//! - [`server`] - HTTP bootstrap and configuration

pub mod api;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod server;

// Re-export commonly used types
pub use domain::{
    AllocatedNumber, DefinitionFormat, DefinitionId, DocumentType, NewDefinition,
    SequenceDefinition, SequenceKey, TenantId,
};

pub use infra::{
    Allocator, AllocatorConfig, DefinitionAdmin, DefinitionRepository, Result, SequenceStore,
    SequencerError,
};
