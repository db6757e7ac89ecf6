//! Performance benchmarks for the store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shiftstore::schema::app;
use shiftstore::{fields, Fields, Query, Store, StoreConfig, Timestamp};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Store {
    Store::open_or_create(bench_config(dir)).unwrap()
}

fn bench_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        seed: false,
        // No checkpoints during the measured loops
        checkpoint_every: 0,
        ..Default::default()
    }
}

fn task(i: usize) -> Fields {
    fields! {
        "text" => format!("Task {i}"),
        "created_at" => Timestamp(i as i64),
        "due_at" => Timestamp((i % 100) as i64),
        "priority" => (i % 3) as i64 + 1,
    }
}

fn populate(store: &Store, count: usize) {
    let batch = (0..count).map(task).collect();
    store.bulk_add(app::TASKS, batch).unwrap();
}

/// Benchmark single-record inserts
fn bench_add(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let mut i = 0;

    c.bench_function("add_task", |b| {
        b.iter(|| {
            i += 1;
            black_box(store.add(app::TASKS, task(i)).unwrap());
        });
    });
}

/// Benchmark batch inserts of varying size
fn bench_bulk_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_add");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("batch", size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            b.iter(|| {
                let batch = (0..size).map(task).collect();
                black_box(store.bulk_add(app::TASKS, batch).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark an indexed range query and a sorted full scan
fn bench_range_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_query");

    for table_size in [1_000, 10_000] {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        populate(&store, table_size);

        let indexed = Query::table(app::TASKS).where_between("due_at", Timestamp(10), Timestamp(12));
        group.bench_with_input(BenchmarkId::new("indexed", table_size), &indexed, |b, q| {
            b.iter(|| black_box(store.query(q).unwrap()));
        });

        // Unfiltered, so every row is sorted before the limit
        let sorted = Query::table(app::TASKS).order_by("text").limit(10);
        group.bench_with_input(BenchmarkId::new("scan_sort", table_size), &sorted, |b, q| {
            b.iter(|| black_box(store.query(q).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark write latency with live queries attached
fn bench_live_query_recompute(c: &mut Criterion) {
    let mut group = c.benchmark_group("live_query_recompute");

    for subscriptions in [0, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("subscriptions", subscriptions),
            &subscriptions,
            |b, &count| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir);
                populate(&store, 1_000);
                for s in 0..count {
                    let day = Timestamp((s % 100) as i64);
                    store
                        .subscribe(
                            Query::table(app::TASKS).where_eq("due_at", day),
                            |records| {
                                black_box(records.len());
                            },
                        )
                        .unwrap();
                }

                let mut i = 1_000;
                b.iter(|| {
                    i += 1;
                    store.add(app::TASKS, task(i)).unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark reopen: checkpoint load plus journal replay
fn bench_reopen(c: &mut Criterion) {
    let mut group = c.benchmark_group("reopen");
    group.sample_size(10);

    for journaled in [0, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("journal_entries", journaled),
            &journaled,
            |b, &journaled| {
                let dir = TempDir::new().unwrap();
                {
                    let store = create_store(&dir);
                    populate(&store, 10_000);
                    store.sync().unwrap();
                    for i in 0..journaled {
                        store.add(app::TASKS, task(10_000 + i)).unwrap();
                    }
                    // Skip the checkpoint on drop
                    std::mem::forget(store);
                }

                let snapshot = std::fs::read(dir.path().join("store/tables.snap")).unwrap();
                let journal = std::fs::read(dir.path().join("store/journal.log")).unwrap();
                let manifest = std::fs::read(dir.path().join("store/MANIFEST")).unwrap();
                let schema = std::fs::read(dir.path().join("store/schema.json")).unwrap();

                b.iter(|| {
                    let copy = TempDir::new().unwrap();
                    let path = copy.path().join("store");
                    std::fs::create_dir_all(&path).unwrap();
                    std::fs::write(path.join("tables.snap"), &snapshot).unwrap();
                    std::fs::write(path.join("journal.log"), &journal).unwrap();
                    std::fs::write(path.join("MANIFEST"), &manifest).unwrap();
                    std::fs::write(path.join("schema.json"), &schema).unwrap();

                    let store = Store::open_or_create(StoreConfig {
                        path,
                        ..bench_config(&copy)
                    })
                    .unwrap();
                    black_box(store.count(app::TASKS).unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add,
    bench_bulk_add,
    bench_range_query,
    bench_live_query_recompute,
    bench_reopen,
);
criterion_main!(benches);
