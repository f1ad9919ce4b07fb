//! In-memory sequence store
//!
//! Each definition sits behind its own `tokio::sync::Mutex`, so allocations for
//! different keys never contend. Exclusion holds within one process only; use
//! the PostgreSQL or SQLite store when several processes allocate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::domain::{
    CounterState, DefinitionFormat, DefinitionId, NewDefinition, SequenceDefinition, SequenceKey,
    TenantId,
};

use super::{CounterMutation, DefinitionRepository, Result, SequenceStore, SequencerError};

type Row = Arc<Mutex<SequenceDefinition>>;

#[derive(Default)]
struct Rows {
    by_id: HashMap<DefinitionId, Row>,
    /// Every row, deleted or not, mirroring the table's unique constraint
    by_key: HashMap<SequenceKey, DefinitionId>,
}

/// Process-local store for tests, demos and single-node deployments
#[derive(Default)]
pub struct MemorySequenceStore {
    rows: RwLock<Rows>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row_by_id(&self, id: DefinitionId) -> Option<Row> {
        self.rows.read().await.by_id.get(&id).cloned()
    }

    async fn row_by_key(&self, key: &SequenceKey) -> Option<Row> {
        let rows = self.rows.read().await;
        rows.by_key.get(key).and_then(|id| rows.by_id.get(id)).cloned()
    }

    /// Overwrite the counter of an active definition.
    ///
    /// For fixtures and for importing counters from an existing numbering
    /// scheme; allocation never goes through here.
    pub async fn seed_counter(
        &self,
        id: DefinitionId,
        last_number: u64,
        last_generated_year: i32,
    ) -> Result<SequenceDefinition> {
        let row = self
            .row_by_id(id)
            .await
            .ok_or_else(|| SequencerError::NotFound(id.to_string()))?;
        let mut current = row.lock().await;
        if current.is_deleted() {
            return Err(SequencerError::NotFound(id.to_string()));
        }

        let counter = CounterState {
            last_number,
            last_generated_year,
        };
        *current = current.with_counter(counter, Utc::now());
        Ok(current.clone())
    }
}

#[async_trait]
impl SequenceStore for MemorySequenceStore {
    #[instrument(skip(self, mutate), fields(key = %key))]
    async fn with_row_lock(
        &self,
        key: &SequenceKey,
        timeout: Duration,
        mutate: CounterMutation<'_>,
    ) -> Result<SequenceDefinition> {
        let row = self
            .row_by_key(key)
            .await
            .ok_or_else(|| SequencerError::NotFound(key.to_string()))?;

        let start = Instant::now();
        let mut current = tokio::time::timeout(timeout, row.lock())
            .await
            .map_err(|_| SequencerError::LockTimeout {
                key: key.to_string(),
                waited_ms: start.elapsed().as_millis() as u64,
            })?;

        if current.is_deleted() {
            return Err(SequencerError::NotFound(key.to_string()));
        }

        let next = mutate(&current)?;
        *current = current.with_counter(next, Utc::now());
        Ok(current.clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DefinitionRepository for MemorySequenceStore {
    async fn insert(&self, definition: NewDefinition, year: i32) -> Result<SequenceDefinition> {
        let key = definition.key();
        let mut rows = self.rows.write().await;

        if let Some(row) = rows.by_key.get(&key).and_then(|id| rows.by_id.get(id)) {
            let mut existing = row.lock().await;
            if !existing.is_deleted() {
                return Err(SequencerError::Conflict {
                    tenant_id: key.tenant_id.0,
                    document_type: key.document_type.0,
                });
            }

            let mut revived = existing.with_format(definition.format, Utc::now());
            revived.deleted_at = None;
            *existing = revived;
            return Ok(existing.clone());
        }

        let created = SequenceDefinition::create(definition, year, Utc::now());
        rows.by_key.insert(key, created.id);
        rows.by_id
            .insert(created.id, Arc::new(Mutex::new(created.clone())));
        Ok(created)
    }

    async fn update_format(
        &self,
        id: DefinitionId,
        format: DefinitionFormat,
    ) -> Result<SequenceDefinition> {
        let row = self
            .row_by_id(id)
            .await
            .ok_or_else(|| SequencerError::NotFound(id.to_string()))?;
        let mut current = row.lock().await;
        if current.is_deleted() {
            return Err(SequencerError::NotFound(id.to_string()));
        }

        *current = current.with_format(format, Utc::now());
        Ok(current.clone())
    }

    async fn soft_delete(&self, id: DefinitionId) -> Result<()> {
        let row = self
            .row_by_id(id)
            .await
            .ok_or_else(|| SequencerError::NotFound(id.to_string()))?;
        let mut current = row.lock().await;
        if current.is_deleted() {
            return Err(SequencerError::NotFound(id.to_string()));
        }

        let now = Utc::now();
        current.deleted_at = Some(now);
        current.updated_at = now;
        current.version += 1;
        Ok(())
    }

    async fn get(&self, id: DefinitionId) -> Result<Option<SequenceDefinition>> {
        let Some(row) = self.row_by_id(id).await else {
            return Ok(None);
        };
        let current = row.lock().await;
        Ok((!current.is_deleted()).then(|| current.clone()))
    }

    async fn find(&self, key: &SequenceKey) -> Result<Option<SequenceDefinition>> {
        let Some(row) = self.row_by_key(key).await else {
            return Ok(None);
        };
        let current = row.lock().await;
        Ok((!current.is_deleted()).then(|| current.clone()))
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<SequenceDefinition>> {
        let rows: Vec<Row> = {
            let rows = self.rows.read().await;
            rows.by_key
                .iter()
                .filter(|(key, _)| &key.tenant_id == tenant_id)
                .filter_map(|(_, id)| rows.by_id.get(id).cloned())
                .collect()
        };

        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            let current = row.lock().await;
            if !current.is_deleted() {
                definitions.push(current.clone());
            }
        }
        definitions.sort_by(|a, b| a.document_type.cmp(&b.document_type));
        Ok(definitions)
    }
}
