//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use doc_sequencer::domain::{DefinitionFormat, DocumentType, NewDefinition, SequenceDefinition, TenantId};
use doc_sequencer::infra::{DefinitionRepository, SqliteSequenceStore};
use doc_sequencer::server::{Backend, Config};

/// Test tenant ID
pub fn test_tenant_id() -> TenantId {
    TenantId::from_uuid(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap())
}

/// Noon on June 15th of `year`, UTC
pub fn mid_year(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 6, 15, 12, 0, 0).unwrap()
}

/// Server configuration for in-process tests
pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        backend: Backend::Sqlite,
        listen_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        max_connections: 1,
        migrate_on_startup: true,
        lock_timeout: Duration::from_secs(5),
        max_retries: 3,
        utc_offset: FixedOffset::east_opt(0).unwrap(),
    }
}

/// Migrated single-connection in-memory SQLite store
pub async fn sqlite_memory_store() -> Arc<SqliteSequenceStore> {
    let pool = SqliteSequenceStore::connect("sqlite::memory:", 1, Duration::from_secs(5))
        .await
        .unwrap();
    doc_sequencer::migrations::run_sqlite(&pool).await.unwrap();
    Arc::new(SqliteSequenceStore::new(pool))
}

/// Fresh database file in its own temp dir; the file and its WAL
/// companions go away when the returned guard drops
pub fn temp_sqlite_db() -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("sequences.db").display());
    (dir, url)
}

/// Migrated file-backed SQLite store with a multi-connection pool
pub async fn sqlite_file_store(url: &str, connections: u32) -> Arc<SqliteSequenceStore> {
    let pool = SqliteSequenceStore::connect(url, connections, Duration::from_secs(5))
        .await
        .unwrap();
    doc_sequencer::migrations::run_sqlite(&pool).await.unwrap();
    Arc::new(SqliteSequenceStore::new(pool))
}

/// Insert a definition stamped with `year`
pub async fn define(
    repository: &dyn DefinitionRepository,
    tenant_id: &TenantId,
    document_type: &str,
    prefix: &str,
    padding: u32,
    reset_every_year: bool,
    year: i32,
) -> SequenceDefinition {
    repository
        .insert(
            NewDefinition::new(
                tenant_id.clone(),
                DocumentType::from(document_type),
                DefinitionFormat::new(prefix, padding, reset_every_year),
            ),
            year,
        )
        .await
        .unwrap()
}

/// Overwrite a counter directly in SQLite, bypassing the allocator
pub async fn seed_sqlite_counter(
    store: &SqliteSequenceStore,
    definition: &SequenceDefinition,
    last_number: u64,
    last_generated_year: i32,
) {
    sqlx::query(
        "UPDATE sequence_definitions SET last_number = ?, last_generated_year = ? WHERE id = ?",
    )
    .bind(last_number as i64)
    .bind(last_generated_year)
    .bind(definition.id.0.to_string())
    .execute(store.pool())
    .await
    .unwrap();
}
