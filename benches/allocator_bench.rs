//! Performance benchmarks for the document sequencer.
//!
//! Run with: cargo bench

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use doc_sequencer::domain::{
    format_number, DefinitionFormat, DocumentType, NewDefinition, TenantId,
};
use doc_sequencer::infra::{
    Allocator, DefinitionRepository, MemorySequenceStore, SequenceStore, SqliteSequenceStore,
};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

async fn seeded<S>(store: Arc<S>) -> (Arc<Allocator>, TenantId)
where
    S: SequenceStore + DefinitionRepository + 'static,
{
    let tenant = TenantId::new();
    store
        .insert(
            NewDefinition::new(
                tenant.clone(),
                DocumentType::invoice(),
                DefinitionFormat::new("INV-", 6, true),
            ),
            2025,
        )
        .await
        .unwrap();
    (Arc::new(Allocator::new(store)), tenant)
}

/// Benchmark number formatting
fn bench_format_number(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_number");

    for padding in [1u32, 6, 16].iter() {
        group.bench_with_input(BenchmarkId::new("padding", padding), padding, |b, &padding| {
            b.iter(|| black_box(format_number("INV-", padding, black_box(123_456))));
        });
    }

    group.finish();
}

/// Benchmark single allocations against each backend
fn bench_allocate_single(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("allocate_single");

    let (memory, memory_tenant) = rt.block_on(seeded(Arc::new(MemorySequenceStore::new())));
    group.bench_function("memory", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                memory
                    .allocate_next(&memory_tenant, &DocumentType::invoice())
                    .await
                    .unwrap(),
            )
        });
    });

    let sqlite_store = rt.block_on(async {
        let pool = SqliteSequenceStore::connect("sqlite::memory:", 1, Duration::from_secs(5))
            .await
            .unwrap();
        doc_sequencer::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqliteSequenceStore::new(pool))
    });
    let (sqlite, sqlite_tenant) = rt.block_on(seeded(sqlite_store));
    group.bench_function("sqlite_memory", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                sqlite
                    .allocate_next(&sqlite_tenant, &DocumentType::invoice())
                    .await
                    .unwrap(),
            )
        });
    });

    group.finish();
}

/// Benchmark contended allocations on one key
fn bench_allocate_contended(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("allocate_contended");

    for tasks in [2usize, 8, 32].iter() {
        let (allocator, tenant) = rt.block_on(seeded(Arc::new(MemorySequenceStore::new())));

        group.throughput(Throughput::Elements(*tasks as u64));
        group.bench_with_input(BenchmarkId::new("memory", tasks), tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| {
                let allocator = allocator.clone();
                let tenant = tenant.clone();
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|_| {
                            let allocator = allocator.clone();
                            let tenant = tenant.clone();
                            tokio::spawn(async move {
                                allocator
                                    .allocate_next(&tenant, &DocumentType::invoice())
                                    .await
                                    .unwrap()
                            })
                        })
                        .collect();
                    for handle in handles {
                        black_box(handle.await.unwrap());
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_format_number,
    bench_allocate_single,
    bench_allocate_contended
);
criterion_main!(benches);
