//! Sequence definitions and the pure numbering rules
//!
//! A [`SequenceDefinition`] is read as an immutable value. Counter changes are
//! computed here ([`SequenceDefinition::next_counter`]) and committed by a
//! `SequenceStore` under its row lock; format changes go through
//! administration. Nothing mutates a definition in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DefinitionId, DocumentType, SequenceKey, TenantId, MAX_DOCUMENT_TYPE_LEN};

/// Maximum zero-padding width
pub const MAX_PADDING: u32 = 32;

/// Maximum prefix length in characters
pub const MAX_PREFIX_LEN: usize = 32;

/// Errors raised by the numbering rules themselves
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("document_type must not be blank")]
    BlankDocumentType,

    #[error("document_type must be at most {MAX_DOCUMENT_TYPE_LEN} characters")]
    DocumentTypeTooLong,

    #[error("padding must be between 1 and {MAX_PADDING}, got {0}")]
    InvalidPadding(u32),

    #[error("prefix must be at most {MAX_PREFIX_LEN} characters")]
    PrefixTooLong,

    #[error("counter exhausted for {0}")]
    CounterExhausted(SequenceKey),
}

/// Formatting rules of a sequence; the only fields administration may change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionFormat {
    /// Literal prepended to every number (may be empty)
    pub prefix: String,
    /// Minimum digit width, zero-filled on the left
    pub padding: u32,
    /// Restart at 1 on the first allocation of each calendar year
    pub reset_every_year: bool,
}

impl DefinitionFormat {
    pub fn new(prefix: impl Into<String>, padding: u32, reset_every_year: bool) -> Self {
        Self {
            prefix: prefix.into(),
            padding,
            reset_every_year,
        }
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.padding == 0 || self.padding > MAX_PADDING {
            return Err(DefinitionError::InvalidPadding(self.padding));
        }
        if self.prefix.chars().count() > MAX_PREFIX_LEN {
            return Err(DefinitionError::PrefixTooLong);
        }
        Ok(())
    }
}

/// Input for creating a definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDefinition {
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    pub format: DefinitionFormat,
}

impl NewDefinition {
    pub fn new(tenant_id: TenantId, document_type: DocumentType, format: DefinitionFormat) -> Self {
        Self {
            tenant_id,
            document_type,
            format,
        }
    }

    pub fn key(&self) -> SequenceKey {
        SequenceKey::new(self.tenant_id.clone(), self.document_type.clone())
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.document_type.is_blank() {
            return Err(DefinitionError::BlankDocumentType);
        }
        if self.document_type.as_str().chars().count() > MAX_DOCUMENT_TYPE_LEN {
            return Err(DefinitionError::DocumentTypeTooLong);
        }
        self.format.validate()
    }
}

/// Counter columns of a definition, owned exclusively by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub last_number: u64,
    pub last_generated_year: i32,
}

/// Persisted configuration and counter state for one (tenant, document type)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: DefinitionId,
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
    pub prefix: String,
    pub padding: u32,
    pub reset_every_year: bool,
    /// Last counter value issued (0 before the first allocation)
    pub last_number: u64,
    /// Calendar year in which `last_number` was issued
    pub last_generated_year: i32,
    /// Bumped on every committed write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SequenceDefinition {
    /// Build a fresh definition with an unused counter
    pub fn create(new: NewDefinition, year: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: DefinitionId::new(),
            tenant_id: new.tenant_id,
            document_type: new.document_type,
            prefix: new.format.prefix,
            padding: new.format.padding,
            reset_every_year: new.format.reset_every_year,
            last_number: 0,
            last_generated_year: year,
            version: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn key(&self) -> SequenceKey {
        SequenceKey::new(self.tenant_id.clone(), self.document_type.clone())
    }

    pub fn format(&self) -> DefinitionFormat {
        DefinitionFormat::new(self.prefix.clone(), self.padding, self.reset_every_year)
    }

    pub fn counter(&self) -> CounterState {
        CounterState {
            last_number: self.last_number,
            last_generated_year: self.last_generated_year,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Counter state after one allocation in `year`.
    ///
    /// Rollover and increment are a single step: callers persist the result as
    /// a whole or not at all.
    pub fn next_counter(&self, year: i32) -> Result<CounterState, DefinitionError> {
        let base = if self.reset_every_year && self.last_generated_year != year {
            0
        } else {
            self.last_number
        };

        let last_number = base
            .checked_add(1)
            .filter(|n| *n <= i64::MAX as u64)
            .ok_or_else(|| DefinitionError::CounterExhausted(self.key()))?;

        Ok(CounterState {
            last_number,
            last_generated_year: year,
        })
    }

    /// The formatted form of the current `last_number`
    pub fn formatted_last(&self) -> String {
        format_number(&self.prefix, self.padding, self.last_number)
    }

    /// A copy with the counter replaced, as a store would commit it
    pub fn with_counter(&self, counter: CounterState, now: DateTime<Utc>) -> Self {
        Self {
            last_number: counter.last_number,
            last_generated_year: counter.last_generated_year,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    /// A copy with the format replaced; the counter is untouched
    pub fn with_format(&self, format: DefinitionFormat, now: DateTime<Utc>) -> Self {
        Self {
            prefix: format.prefix,
            padding: format.padding,
            reset_every_year: format.reset_every_year,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// `prefix` followed by `number` zero-filled to at least `padding` digits.
///
/// Numbers wider than `padding` are never truncated.
pub fn format_number(prefix: &str, padding: u32, number: u64) -> String {
    format!("{prefix}{number:0width$}", width = padding as usize)
}

/// Result of one allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedNumber {
    pub definition_id: DefinitionId,
    pub formatted_number: String,
    pub raw_number: u64,
    /// Calendar year the number was issued in
    pub year: i32,
}

impl AllocatedNumber {
    /// Build the result from a definition as committed by the store
    pub fn from_committed(definition: &SequenceDefinition) -> Self {
        Self {
            definition_id: definition.id,
            formatted_number: definition.formatted_last(),
            raw_number: definition.last_number,
            year: definition.last_generated_year,
        }
    }
}
