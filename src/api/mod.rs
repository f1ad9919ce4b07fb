//! API layer for the document sequencer
//!
//! REST endpoints for allocation and definition administration.

pub mod error;
mod rest;
pub mod types;

pub use error::{ApiError, ErrorCode};
pub use rest::*;
