//! SQLite sequence store
//!
//! Allocation reads the row, computes the next counter, then commits with
//! ```sql
//! UPDATE sequence_definitions
//! SET last_number = ?, last_generated_year = ?, version = version + 1, updated_at = ?
//! WHERE id = ? AND version = ? AND deleted_at IS NULL
//! ```
//! Zero affected rows means another writer committed first; the loop re-reads
//! and tries again. A single statement is atomic in SQLite, so a counter value
//! is committed by exactly one writer even across processes sharing the file.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::FromRow;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{
    DefinitionFormat, DefinitionId, DocumentType, NewDefinition, SequenceDefinition, SequenceKey,
    TenantId,
};
use crate::infra::retry::{is_sqlite_busy_code, RetryConfig};
use crate::infra::{CounterMutation, DefinitionRepository, Result, SequenceStore, SequencerError};

const COLUMNS: &str = "id, tenant_id, document_type, prefix, padding, reset_every_year, \
     last_number, last_generated_year, version, created_at, updated_at, deleted_at";

/// SQLite-backed definitions and counters
#[derive(Clone)]
pub struct SqliteSequenceStore {
    pool: SqlitePool,
    backoff: RetryConfig,
}

impl SqliteSequenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            backoff: RetryConfig::compare_and_swap(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a pool in WAL mode, creating the file if needed.
    ///
    /// In-memory databases are private to a connection, so they get exactly one.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    async fn fetch_active(&self, key: &SequenceKey) -> Result<Option<SequenceDefinition>> {
        let mut conn = self.pool.acquire().await?;
        select_active(&mut conn, key).await
    }
}

async fn select_active(
    conn: &mut SqliteConnection,
    key: &SequenceKey,
) -> Result<Option<SequenceDefinition>> {
    let row: Option<DefinitionRow> = sqlx::query_as(&format!(
        r#"
        SELECT {COLUMNS}
        FROM sequence_definitions
        WHERE tenant_id = ? AND document_type = ? AND deleted_at IS NULL
        "#
    ))
    .bind(key.tenant_id.0.to_string())
    .bind(key.document_type.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(TryInto::try_into).transpose()
}

fn lock_timeout(key: &SequenceKey, start: Instant) -> SequencerError {
    SequencerError::LockTimeout {
        key: key.to_string(),
        waited_ms: start.elapsed().as_millis() as u64,
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| is_sqlite_busy_code(&code))
            .unwrap_or(false),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

#[async_trait]
impl SequenceStore for SqliteSequenceStore {
    #[instrument(skip(self, mutate), fields(key = %key))]
    async fn with_row_lock(
        &self,
        key: &SequenceKey,
        timeout: Duration,
        mutate: CounterMutation<'_>,
    ) -> Result<SequenceDefinition> {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            // Waiting for a pooled connection counts against the lock budget.
            let remaining = timeout.saturating_sub(start.elapsed());
            let mut conn = tokio::time::timeout(remaining, self.pool.acquire())
                .await
                .map_err(|_| lock_timeout(key, start))?
                .map_err(|e| {
                    if is_busy(&e) {
                        lock_timeout(key, start)
                    } else {
                        SequencerError::from(e)
                    }
                })?;

            match select_active(&mut conn, key).await {
                Ok(Some(current)) => {
                    let next = mutate(&current)?;
                    let now = Utc::now();

                    let result = sqlx::query(
                        r#"
                        UPDATE sequence_definitions
                        SET last_number = ?,
                            last_generated_year = ?,
                            version = version + 1,
                            updated_at = ?
                        WHERE id = ? AND version = ? AND deleted_at IS NULL
                        "#,
                    )
                    .bind(next.last_number as i64)
                    .bind(next.last_generated_year)
                    .bind(now.to_rfc3339())
                    .bind(current.id.0.to_string())
                    .bind(current.version)
                    .execute(&mut *conn)
                    .await;

                    match result {
                        Ok(done) if done.rows_affected() == 1 => {
                            if attempt > 0 {
                                debug!(attempts = attempt + 1, "Compare-and-swap succeeded");
                            }
                            return Ok(current.with_counter(next, now));
                        }
                        // Lost the race, or the writer lock is held
                        Ok(_) => {}
                        Err(e) if is_busy(&e) => {}
                        Err(e) => return Err(SequencerError::PersistenceFailure(e.to_string())),
                    }
                }
                Ok(None) => return Err(SequencerError::NotFound(key.to_string())),
                Err(SequencerError::Database(e)) if is_busy(&e) => {}
                Err(e) => return Err(e),
            }
            drop(conn);

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(lock_timeout(key, start));
            }

            let delay = self
                .backoff
                .delay_for_attempt(attempt)
                .min(timeout - elapsed);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DefinitionRepository for SqliteSequenceStore {
    #[instrument(skip(self, definition), fields(tenant_id = %definition.tenant_id, document_type = %definition.document_type))]
    async fn insert(&self, definition: NewDefinition, year: i32) -> Result<SequenceDefinition> {
        let now = Utc::now().to_rfc3339();
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO sequence_definitions (
                id, tenant_id, document_type, prefix, padding, reset_every_year,
                last_number, last_generated_year, version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, 0, ?, ?)
            ON CONFLICT (tenant_id, document_type) DO UPDATE SET
                prefix = excluded.prefix,
                padding = excluded.padding,
                reset_every_year = excluded.reset_every_year,
                deleted_at = NULL,
                version = sequence_definitions.version + 1,
                updated_at = excluded.updated_at
            WHERE sequence_definitions.deleted_at IS NOT NULL
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(definition.tenant_id.0.to_string())
        .bind(definition.document_type.as_str())
        .bind(&definition.format.prefix)
        .bind(definition.format.padding as i64)
        .bind(definition.format.reset_every_year)
        .bind(year)
        .bind(&now)
        .bind(&now)
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
            SET prefix = ?,
                padding = ?,
                reset_every_year = ?,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&format.prefix)
        .bind(format.padding as i64)
        .bind(format.reset_every_year)
        .bind(Utc::now().to_rfc3339())
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| SequencerError::NotFound(id.to_string()))?
            .try_into()
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, id: DefinitionId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE sequence_definitions
            SET deleted_at = ?,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SequencerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: DefinitionId) -> Result<Option<SequenceDefinition>> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sequence_definitions WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find(&self, key: &SequenceKey) -> Result<Option<SequenceDefinition>> {
        self.fetch_active(key).await
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<SequenceDefinition>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM sequence_definitions
            WHERE tenant_id = ? AND deleted_at IS NULL
            ORDER BY document_type
            "#
        ))
        .bind(tenant_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

/// Raw row; ids and timestamps are stored as text
#[derive(Debug, FromRow)]
struct DefinitionRow {
    id: String,
    tenant_id: String,
    document_type: String,
    prefix: String,
    padding: i64,
    reset_every_year: bool,
    last_number: i64,
    last_generated_year: i64,
    version: i64,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SequencerError::Internal(format!("Invalid {field}: {e}")))
}

impl TryFrom<DefinitionRow> for SequenceDefinition {
    type Error = SequencerError;

    fn try_from(row: DefinitionRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| SequencerError::Internal(format!("Invalid id: {}", e)))?;

        let tenant_id = Uuid::parse_str(&row.tenant_id)
            .map_err(|e| SequencerError::Internal(format!("Invalid tenant_id: {}", e)))?;

        let padding = u32::try_from(row.padding)
            .map_err(|_| SequencerError::Internal(format!("Invalid padding: {}", row.padding)))?;

        let last_number = u64::try_from(row.last_number).map_err(|_| {
            SequencerError::Internal(format!("Invalid last_number: {}", row.last_number))
        })?;

        let last_generated_year = i32::try_from(row.last_generated_year).map_err(|_| {
            SequencerError::Internal(format!(
                "Invalid last_generated_year: {}",
                row.last_generated_year
            ))
        })?;

        let deleted_at = row
            .deleted_at
            .as_deref()
            .map(|s| parse_timestamp("deleted_at", s))
            .transpose()?;

        Ok(SequenceDefinition {
            id: DefinitionId::from_uuid(id),
            tenant_id: TenantId::from_uuid(tenant_id),
            document_type: DocumentType::from(row.document_type),
            prefix: row.prefix,
            padding,
            reset_every_year: row.reset_every_year,
            last_number,
            last_generated_year,
            version: row.version,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            deleted_at,
        })
    }
}
