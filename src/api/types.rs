//! Shared request and response types for REST API handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AllocatedNumber, SequenceDefinition, SequenceKey};

// ============================================================================
// Definition types
// ============================================================================

/// Request body for creating a sequence definition.
#[derive(Debug, Deserialize)]
pub struct CreateDefinitionRequest {
    pub tenant_id: Uuid,
    pub document_type: String,
    #[serde(default)]
    pub prefix: String,
    pub padding: u32,
    #[serde(default)]
    pub reset_every_year: bool,
}

/// Request body for replacing the format of a definition.
#[derive(Debug, Deserialize)]
pub struct UpdateDefinitionRequest {
    #[serde(default)]
    pub prefix: String,
    pub padding: u32,
    #[serde(default)]
    pub reset_every_year: bool,
}

/// A sequence definition as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct DefinitionResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub document_type: String,
    pub prefix: String,
    pub padding: u32,
    pub reset_every_year: bool,
    pub last_number: u64,
    pub last_generated_year: i32,
    /// Formatted form of `last_number`, absent before the first allocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_formatted: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SequenceDefinition> for DefinitionResponse {
    fn from(def: SequenceDefinition) -> Self {
        let last_formatted = (def.last_number > 0).then(|| def.formatted_last());
        Self {
            id: def.id.0,
            tenant_id: def.tenant_id.0,
            document_type: def.document_type.0,
            prefix: def.prefix,
            padding: def.padding,
            reset_every_year: def.reset_every_year,
            last_number: def.last_number,
            last_generated_year: def.last_generated_year,
            last_formatted,
            created_at: def.created_at,
            updated_at: def.updated_at,
        }
    }
}

/// Response for listing the definitions of a tenant.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListDefinitionsResponse {
    pub tenant_id: Uuid,
    pub definitions: Vec<DefinitionResponse>,
    pub count: usize,
}

// ============================================================================
// Allocation types
// ============================================================================

/// Response for an allocation or a preview.
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub definition_id: Uuid,
    pub tenant_id: Uuid,
    pub document_type: String,
    pub formatted_number: String,
    pub raw_number: u64,
    pub year: i32,
}

impl AllocationResponse {
    pub fn new(key: SequenceKey, allocated: AllocatedNumber) -> Self {
        Self {
            definition_id: allocated.definition_id.0,
            tenant_id: key.tenant_id.0,
            document_type: key.document_type.0,
            formatted_number: allocated.formatted_number,
            raw_number: allocated.raw_number,
            year: allocated.year,
        }
    }
}
