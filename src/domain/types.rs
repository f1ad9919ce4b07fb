//! Identifier types for document number sequences

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a document type name
pub const MAX_DOCUMENT_TYPE_LEN: usize = 64;

/// Tenant identifier (organization/account level)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub uuid::Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surrogate identifier of a sequence definition, used by administration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefinitionId(pub uuid::Uuid);

impl DefinitionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical name of the thing being numbered ("Invoice", "Receipt", ...)
///
/// Compared exactly; `Invoice` and `invoice` are different sequences.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentType(pub String);

impl DocumentType {
    pub const INVOICE: &'static str = "Invoice";
    pub const RECEIPT: &'static str = "Receipt";
    pub const ADMISSION: &'static str = "Admission";

    pub fn new(document_type: impl Into<String>) -> Self {
        Self(document_type.into())
    }

    pub fn invoice() -> Self {
        Self(Self::INVOICE.to_string())
    }

    pub fn receipt() -> Self {
        Self(Self::RECEIPT.to_string())
    }

    pub fn admission() -> Self {
        Self(Self::ADMISSION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank names (empty or whitespace only) never identify a sequence
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one sequence: the (tenant, document type) pair.
///
/// This is the unit of locking. Two different keys never contend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    pub tenant_id: TenantId,
    pub document_type: DocumentType,
}

impl SequenceKey {
    pub fn new(tenant_id: TenantId, document_type: DocumentType) -> Self {
        Self {
            tenant_id,
            document_type,
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.document_type)
    }
}
