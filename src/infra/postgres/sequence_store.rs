//! PostgreSQL sequence store
//!
//! # Atomicity
//!
//! Allocation locks the definition row for the length of one transaction:
//! ```sql
//! BEGIN;
//! SET LOCAL lock_timeout = '<n>ms';
//! SELECT ... FROM sequence_definitions
//!     WHERE tenant_id = $1 AND document_type = $2 AND deleted_at IS NULL
//!     FOR UPDATE;
//! UPDATE sequence_definitions SET last_number = ..., last_generated_year = ...;
//! COMMIT;
//! ```
//!
//! A second allocator for the same key blocks on the `SELECT` until the first
//! commits, then reads the committed counter. Waiting longer than the lock
//! budget aborts with SQLSTATE `55P03`, reported as `LockTimeout`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{
    DefinitionFormat, DefinitionId, DocumentType, NewDefinition, SequenceDefinition, SequenceKey,
    TenantId,
};
use crate::infra::{CounterMutation, DefinitionRepository, Result, SequenceStore, SequencerError};

const COLUMNS: &str = "id, tenant_id, document_type, prefix, padding, reset_every_year, \
     last_number, last_generated_year, version, created_at, updated_at, deleted_at";

/// PostgreSQL-backed definitions and counters
#[derive(Clone)]
pub struct PgSequenceStore {
    pool: PgPool,
}

impl PgSequenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn lock_timeout(key: &SequenceKey, start: Instant) -> SequencerError {
    SequencerError::LockTimeout {
        key: key.to_string(),
        waited_ms: start.elapsed().as_millis() as u64,
    }
}

fn is_lock_not_available(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("55P03"),
        _ => false,
    }
}

#[async_trait]
impl SequenceStore for PgSequenceStore {
    #[instrument(skip(self, mutate), fields(key = %key))]
    async fn with_row_lock(
        &self,
        key: &SequenceKey,
        timeout: Duration,
        mutate: CounterMutation<'_>,
    ) -> Result<SequenceDefinition> {
        let start = Instant::now();

        // Waiting for a pooled connection counts against the lock budget.
        let mut tx = tokio::time::timeout(timeout, self.pool.begin())
            .await
            .map_err(|_| lock_timeout(key, start))??;

        let remaining_ms = timeout.saturating_sub(start.elapsed()).as_millis().max(1);
        sqlx::query(&format!("SET LOCAL lock_timeout = '{remaining_ms}ms'"))
            .execute(&mut *tx)
            .await?;

        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sequence_definitions
            WHERE tenant_id = $1 AND document_type = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#
        ))
        .bind(key.tenant_id.0)
        .bind(key.document_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            if is_lock_not_available(&e) {
                lock_timeout(key, start)
            } else {
                SequencerError::from(e)
            }
        })?;

        let current: SequenceDefinition = row
            .ok_or_else(|| SequencerError::NotFound(key.to_string()))?
            .try_into()?;

        let next = mutate(&current)?;

        let committed: DefinitionRow = sqlx::query_as(&format!(
            r#"
            UPDATE sequence_definitions
            SET last_number = $2,
                last_generated_year = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(current.id.0)
        .bind(next.last_number as i64)
        .bind(next.last_generated_year)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SequencerError::PersistenceFailure(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SequencerError::PersistenceFailure(e.to_string()))?;

        debug!(
            last_number = next.last_number,
            waited_ms = start.elapsed().as_millis() as u64,
            "Committed sequence counter"
        );

        committed.try_into()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DefinitionRepository for PgSequenceStore {
    #[instrument(skip(self, definition), fields(tenant_id = %definition.tenant_id, document_type = %definition.document_type))]
    async fn insert(&self, definition: NewDefinition, year: i32) -> Result<SequenceDefinition> {
        // A soft-deleted row for the same key is revived in place; an active
        // one makes the conditional upsert return nothing.
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO sequence_definitions (
                id, tenant_id, document_type, prefix, padding, reset_every_year,
                last_number, last_generated_year, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, 0, NOW(), NOW())
            ON CONFLICT (tenant_id, document_type) DO UPDATE SET
                prefix = EXCLUDED.prefix,
                padding = EXCLUDED.padding,
                reset_every_year = EXCLUDED.reset_every_year,
                deleted_at = NULL,
                version = sequence_definitions.version + 1,
                updated_at = NOW()
            WHERE sequence_definitions.deleted_at IS NOT NULL
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(definition.tenant_id.0)
        .bind(definition.document_type.as_str())
        .bind(&definition.format.prefix)
        .bind(definition.format.padding as i32)
        .bind(definition.format.reset_every_year)
        .bind(year)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(SequencerError::Conflict {
                tenant_id: definition.tenant_id.0,
                document_type: definition.document_type.0,
            }),
        }
    }

    #[instrument(skip(self, format))]
    async fn update_format(
        &self,
        id: DefinitionId,
        format: DefinitionFormat,
    ) -> Result<SequenceDefinition> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE sequence_definitions
            SET prefix = $2,
                padding = $3,
                reset_every_year = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(&format.prefix)
        .bind(format.padding as i32)
        .bind(format.reset_every_year)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| SequencerError::NotFound(id.to_string()))?
            .try_into()
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, id: DefinitionId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sequence_definitions
            SET deleted_at = NOW(),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SequencerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: DefinitionId) -> Result<Option<SequenceDefinition>> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sequence_definitions WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find(&self, key: &SequenceKey) -> Result<Option<SequenceDefinition>> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sequence_definitions
            WHERE tenant_id = $1 AND document_type = $2 AND deleted_at IS NULL
            "#
        ))
        .bind(key.tenant_id.0)
        .bind(key.document_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<SequenceDefinition>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sequence_definitions
            WHERE tenant_id = $1 AND deleted_at IS NULL
            ORDER BY document_type COLLATE "C"
            "#
        ))
        .bind(tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(Debug, FromRow)]
struct DefinitionRow {
    id: Uuid,
    tenant_id: Uuid,
    document_type: String,
    prefix: String,
    padding: i32,
    reset_every_year: bool,
    last_number: i64,
    last_generated_year: i32,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<DefinitionRow> for SequenceDefinition {
    type Error = SequencerError;

    fn try_from(row: DefinitionRow) -> Result<Self> {
        let padding = u32::try_from(row.padding)
            .map_err(|_| SequencerError::Internal(format!("Invalid padding: {}", row.padding)))?;
        let last_number = u64::try_from(row.last_number).map_err(|_| {
            SequencerError::Internal(format!("Invalid last_number: {}", row.last_number))
        })?;

        Ok(SequenceDefinition {
            id: DefinitionId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            document_type: DocumentType::from(row.document_type),
            prefix: row.prefix,
            padding,
            reset_every_year: row.reset_every_year,
            last_number,
            last_generated_year: row.last_generated_year,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}
