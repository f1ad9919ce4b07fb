//! Allocator integration tests over the SQLite and in-memory backends.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use doc_sequencer::domain::{DocumentType, SequenceDefinition};
use doc_sequencer::infra::{
    Allocator, AllocatorConfig, DefinitionAdmin, DefinitionRepository, FixedClock,
    MemorySequenceStore, SequenceStore, SequencerError, SqliteSequenceStore,
};
use doc_sequencer::TenantId;

use common::*;

async fn allocate_all(
    allocator: Arc<Allocator>,
    tenant: &TenantId,
    document_type: &str,
    tasks: usize,
    per_task: usize,
) -> Vec<String> {
    let mut handles = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        let allocator = allocator.clone();
        let tenant = tenant.clone();
        let document_type = DocumentType::from(document_type);
        handles.push(tokio::spawn(async move {
            let mut numbers = Vec::with_capacity(per_task);
            for _ in 0..per_task {
                let allocated = allocator
                    .allocate_next_at(&tenant, &document_type, &mid_year(2025))
                    .await
                    .unwrap();
                numbers.push(allocated.formatted_number);
            }
            numbers
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

// ============================================================================
// SQLite
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_allocations_are_pairwise_distinct() {
    let (_dir, url) = temp_sqlite_db();
    let store = sqlite_file_store(&url, 8).await;
    let tenant = TenantId::new();
    define(store.as_ref(), &tenant, "Invoice", "INV-", 4, false, 2025).await;

    let allocator = Arc::new(
        Allocator::new(store.clone())
            .with_config(AllocatorConfig::default().with_lock_timeout(Duration::from_secs(30))),
    );
    let numbers = allocate_all(allocator, &tenant, "Invoice", 8, 10).await;

    let unique: HashSet<&String> = numbers.iter().collect();
    assert_eq!(unique.len(), 80);

    let expected: HashSet<String> = (1..=80).map(|i| format!("INV-{:04}", i)).collect();
    assert_eq!(numbers.into_iter().collect::<HashSet<_>>(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_separate_pools_share_one_sequence() {
    // Two pools on one file behave like two processes.
    let (_dir, url) = temp_sqlite_db();
    let first = sqlite_file_store(&url, 4).await;
    let second = sqlite_file_store(&url, 4).await;

    let tenant = TenantId::new();
    define(first.as_ref(), &tenant, "Receipt", "RCP-", 3, false, 2025).await;

    let config = AllocatorConfig::default().with_lock_timeout(Duration::from_secs(30));
    let a = Arc::new(Allocator::new(first).with_config(config.clone()));
    let b = Arc::new(Allocator::new(second).with_config(config));

    let (left, right) = tokio::join!(
        allocate_all(a, &tenant, "Receipt", 3, 10),
        allocate_all(b, &tenant, "Receipt", 3, 10),
    );

    let mut all: Vec<String> = left.into_iter().chain(right).collect();
    all.sort();
    let expected: Vec<String> = (1..=60).map(|i| format!("RCP-{:03}", i)).collect();
    assert_eq!(all, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_five_concurrent_students() {
    let (_dir, url) = temp_sqlite_db();
    let store = sqlite_file_store(&url, 5).await;
    let tenant = TenantId::new();
    define(store.as_ref(), &tenant, "Student", "STU-", 3, false, 2025).await;

    let allocator = Arc::new(Allocator::new(store));
    let numbers: HashSet<String> = allocate_all(allocator, &tenant, "Student", 5, 1)
        .await
        .into_iter()
        .collect();

    let expected: HashSet<String> = ["STU-001", "STU-002", "STU-003", "STU-004", "STU-005"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(numbers, expected);
}

#[tokio::test]
async fn sqlite_padding_overflow_and_rollover() {
    let store = sqlite_memory_store().await;
    let tenant = test_tenant_id();
    let receipt = define(store.as_ref(), &tenant, "Receipt", "RCP-", 4, false, 2025).await;
    let invoice = define(store.as_ref(), &tenant, "Invoice", "INV-", 4, true, 2024).await;
    let admission = define(store.as_ref(), &tenant, "Admission", "ADM-", 4, false, 2024).await;

    seed_sqlite_counter(&store, &receipt, 9999, 2025).await;
    seed_sqlite_counter(&store, &invoice, 57, 2024).await;
    seed_sqlite_counter(&store, &admission, 57, 2024).await;

    let allocator = Allocator::new(store.clone());

    let n = allocator
        .allocate_next_at(&tenant, &DocumentType::receipt(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!(n.formatted_number, "RCP-10000");

    let n = allocator
        .allocate_next_at(&tenant, &DocumentType::invoice(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!((n.raw_number, n.year), (1, 2025));
    assert_eq!(n.formatted_number, "INV-0001");

    let n = allocator
        .allocate_next_at(&tenant, &DocumentType::admission(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!(n.raw_number, 58);

    let stored = store.get(admission.id).await.unwrap().unwrap();
    assert_eq!(stored.last_generated_year, 2025);
}

#[tokio::test]
async fn sqlite_unknown_key_has_no_side_effects() {
    let store = sqlite_memory_store().await;
    let tenant = TenantId::new();
    let allocator = Allocator::new(store.clone());

    let err = allocator
        .allocate_next_at(&tenant, &DocumentType::invoice(), &mid_year(2025))
        .await
        .unwrap_err();
    assert!(matches!(err, SequencerError::NotFound(_)));
    assert!(store.list(&tenant).await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_update_padding_applies_to_next_allocation() {
    let store = sqlite_memory_store().await;
    let admin = DefinitionAdmin::new(store.clone())
        .with_clock(Arc::new(FixedClock::at_utc(mid_year(2025))));
    let allocator = Allocator::new(store.clone());
    let tenant = TenantId::new();

    let def = admin
        .create(tenant.clone(), DocumentType::invoice(), "INV-", 4, false)
        .await
        .unwrap();
    for _ in 0..3 {
        allocator
            .allocate_next_at(&tenant, &DocumentType::invoice(), &mid_year(2025))
            .await
            .unwrap();
    }

    let updated = admin.update(def.id, "INV-", 6, false).await.unwrap();
    assert_eq!(updated.last_number, 3);

    let n = allocator
        .allocate_next_at(&tenant, &DocumentType::invoice(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!(n.formatted_number, "INV-000004");
}

#[tokio::test]
async fn sqlite_deleted_definition_is_not_found_and_recreate_never_repeats() {
    let store = sqlite_memory_store().await;
    let admin = DefinitionAdmin::new(store.clone());
    let allocator = Allocator::new(store.clone());
    let tenant = TenantId::new();

    let def = admin
        .create(tenant.clone(), DocumentType::receipt(), "R-", 3, false)
        .await
        .unwrap();
    let first = allocator
        .allocate_next(&tenant, &DocumentType::receipt())
        .await
        .unwrap();
    assert_eq!(first.formatted_number, "R-001");

    admin.delete(def.id).await.unwrap();
    let err = allocator
        .allocate_next(&tenant, &DocumentType::receipt())
        .await
        .unwrap_err();
    assert!(matches!(err, SequencerError::NotFound(_)));

    admin
        .create(tenant.clone(), DocumentType::receipt(), "R-", 3, false)
        .await
        .unwrap();
    let after = allocator
        .allocate_next(&tenant, &DocumentType::receipt())
        .await
        .unwrap();
    assert_eq!(after.formatted_number, "R-002");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_held_write_lock_times_out_and_commits_nothing() {
    let (_dir, url) = temp_sqlite_db();
    let pool = SqliteSequenceStore::connect(&url, 2, Duration::from_millis(50))
        .await
        .unwrap();
    doc_sequencer::migrations::run_sqlite(&pool).await.unwrap();
    let store = Arc::new(SqliteSequenceStore::new(pool));

    let tenant = TenantId::new();
    let def = define(store.as_ref(), &tenant, "Receipt", "RCP-", 3, false, 2025).await;

    // Another process holds the database write lock.
    let holder_pool = SqliteSequenceStore::connect(&url, 1, Duration::from_millis(50))
        .await
        .unwrap();
    let mut holder = holder_pool.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *holder)
        .await
        .unwrap();
    sqlx::query("UPDATE sequence_definitions SET updated_at = updated_at")
        .execute(&mut *holder)
        .await
        .unwrap();

    let allocator = Allocator::new(store.clone()).with_config(
        AllocatorConfig::default().with_lock_timeout(Duration::from_millis(300)),
    );

    let start = std::time::Instant::now();
    let err = allocator
        .allocate_next_at(&tenant, &DocumentType::receipt(), &mid_year(2025))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, SequencerError::LockTimeout { .. }), "{err:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    drop(holder);

    let stored = store.get(def.id).await.unwrap().unwrap();
    assert_eq!(stored.last_number, 0);

    let next = allocator
        .allocate_next_at(&tenant, &DocumentType::receipt(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!(next.formatted_number, "RCP-001");
}

// ============================================================================
// In-memory
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_allocations_are_pairwise_distinct() {
    let store = Arc::new(MemorySequenceStore::new());
    let tenant = TenantId::new();
    define(store.as_ref(), &tenant, "Invoice", "INV-", 4, false, 2025).await;

    let allocator = Arc::new(Allocator::new(store));
    let numbers = allocate_all(allocator, &tenant, "Invoice", 16, 25).await;

    let unique: HashSet<String> = numbers.into_iter().collect();
    assert_eq!(unique.len(), 400);
    assert!(unique.contains("INV-0400"));
    assert!(!unique.contains("INV-0401"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_held_lock_times_out_without_blocking_other_keys() {
    let store = Arc::new(MemorySequenceStore::new());
    let tenant = TenantId::new();
    let busy = define(store.as_ref(), &tenant, "Invoice", "INV-", 4, false, 2025).await;
    define(store.as_ref(), &tenant, "Receipt", "RCP-", 4, false, 2025).await;

    // Hold the Invoice row by sleeping inside the critical section.
    let holding = Arc::new(AtomicBool::new(false));
    let holder = {
        let store = store.clone();
        let holding = holding.clone();
        let key = busy.key();
        tokio::spawn(async move {
            let mutate = |d: &SequenceDefinition| {
                holding.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(400));
                d.next_counter(2025).map_err(SequencerError::from)
            };
            store
                .with_row_lock(&key, Duration::from_secs(5), &mutate)
                .await
                .unwrap()
        })
    };

    while !holding.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let allocator = Allocator::new(store.clone())
        .with_config(AllocatorConfig::default().with_lock_timeout(Duration::from_millis(50)));

    let err = allocator
        .allocate_next_at(&tenant, &DocumentType::invoice(), &mid_year(2025))
        .await
        .unwrap_err();
    assert!(matches!(err, SequencerError::LockTimeout { .. }));
    assert!(err.is_retryable());

    let other = allocator
        .allocate_next_at(&tenant, &DocumentType::receipt(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!(other.formatted_number, "RCP-0001");

    let committed = holder.await.unwrap();
    assert_eq!(committed.last_number, 1);

    let next = allocator
        .allocate_next_at(&tenant, &DocumentType::invoice(), &mid_year(2025))
        .await
        .unwrap();
    assert_eq!(next.formatted_number, "INV-0002");
}
