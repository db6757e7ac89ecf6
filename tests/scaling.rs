//! Scaling tests for Shiftstore with synthetic 20k+ record tables.
//!
//! Measures the key operations on a large task table:
//! - Bulk population
//! - Indexed queries versus full scans
//! - Live query recomputation under a write stream
//! - Checkpoint and reopen

use shiftstore::schema::app;
use shiftstore::{fields, Fields, Query, Store, StoreConfig, Timestamp};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

const TASK_COUNT: usize = 20_000;
const BATCH: usize = 1_000;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().to_path_buf(),
        seed: false,
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_item = if count > 0 { ms / count as f64 } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.4}ms/item)",
            self.name, ms, count, per_item
        );
    }
}

/// Task `i` is due on day `i % 30` of May 2024 and assigned to one of 50 employees.
fn synthetic_task(i: usize) -> Fields {
    let day = (i % 30) as u32 + 1;
    fields! {
        "text" => format!("Task {i}"),
        "created_at" => Timestamp(i as i64),
        "due_at" => Timestamp::from_ymd_hms(2024, 5, day, 9, 0, 0).unwrap(),
        "assigned_to" => (i % 50) as i64 + 1,
        "completed" => i % 3 == 0,
        "priority" => (i % 3) as i64 + 1,
    }
}

fn populate(store: &Store) {
    for start in (0..TASK_COUNT).step_by(BATCH) {
        let batch = (start..start + BATCH).map(synthetic_task).collect();
        store.bulk_add(app::TASKS, batch).unwrap();
    }
}

fn may(day: u32, hour: u32) -> Timestamp {
    Timestamp::from_ymd_hms(2024, 5, day, hour, 0, 0).unwrap()
}

// =============================================================================
// Test: 20k tasks, indexed queries and reopen
// =============================================================================

#[test]
fn test_scaling_20k_tasks() {
    init_tracing();
    println!("\n=== 20k Tasks ===");

    let dir = TempDir::new().unwrap();

    let timer = Timer::new("Create store");
    let store = Store::open_or_create(test_config(&dir)).unwrap();
    timer.report();

    let timer = Timer::new("Bulk add 20k tasks");
    populate(&store);
    timer.report_with_count(TASK_COUNT);

    let stats = store.stats().unwrap();
    println!(
        "  Store stats: {} records, {} indices, {} journal entries",
        stats.record_count, stats.index_count, stats.journal_entries
    );
    assert_eq!(stats.record_count as usize, TASK_COUNT);

    // Range on an indexed field
    let one_day = Query::table(app::TASKS).where_between("due_at", may(1, 0), may(1, 23));
    assert!(store.explain(&one_day).unwrap().uses_index());
    let timer = Timer::new("Indexed range query (one day)");
    let due = store.query(&one_day).unwrap();
    timer.report_with_count(due.len());
    assert_eq!(due.len(), TASK_COUNT / 30 + usize::from(TASK_COUNT % 30 > 0));

    // Equality on an indexed reference
    let timer = Timer::new("Equality on assigned_to");
    let mine = store
        .query(&Query::table(app::TASKS).where_eq("assigned_to", 7i64))
        .unwrap();
    timer.report_with_count(mine.len());
    assert_eq!(mine.len(), TASK_COUNT / 50);

    let timer = Timer::new("Ordered top 10 by created_at");
    let newest = store
        .query(
            &Query::table(app::TASKS)
                .order_by("created_at")
                .reverse()
                .limit(10),
        )
        .unwrap();
    timer.report();
    assert_eq!(newest[0].get("text").as_str(), Some("Task 19999"));

    let timer = Timer::new("Checkpoint");
    store.sync().unwrap();
    timer.report();
    drop(store);

    let timer = Timer::new("Reopen store (rebuild indices)");
    let store = Store::open_or_create(test_config(&dir)).unwrap();
    timer.report();

    let timer = Timer::new("Verify indices");
    store.verify().unwrap();
    timer.report();
    assert_eq!(store.query(&one_day).unwrap(), due);

    println!("  ✓ 20k task test passed");
}

// =============================================================================
// Test: live queries over a large table
// =============================================================================

#[test]
fn test_scaling_live_queries() {
    init_tracing();
    println!("\n=== Live Queries over 20k Tasks ===");

    let dir = TempDir::new().unwrap();
    let store = Store::open_or_create(test_config(&dir)).unwrap();
    populate(&store);

    // One subscription per day of the month.
    let deliveries = Arc::new(AtomicUsize::new(0));
    let timer = Timer::new("Register 30 live queries");
    for day in 1..=30 {
        let counter = Arc::clone(&deliveries);
        store
            .subscribe(
                Query::table(app::TASKS).where_between("due_at", may(day, 0), may(day, 23)),
                move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap();
    }
    timer.report_with_count(30);
    assert_eq!(deliveries.load(Ordering::Relaxed), 30);

    // Each write changes exactly one day's result.
    let writes = 200;
    let timer = Timer::new("Writes with 30 live queries");
    for i in 0..writes {
        let day = (i % 30) as u32 + 1;
        store
            .add(
                app::TASKS,
                fields! {
                    "text" => format!("Extra {i}"),
                    "created_at" => Timestamp::now(),
                    "due_at" => may(day, 12),
                },
            )
            .unwrap();
    }
    timer.report_with_count(writes);

    assert_eq!(deliveries.load(Ordering::Relaxed), 30 + writes);
    assert_eq!(store.stats().unwrap().subscription_count, 30);

    println!("  ✓ Live query scaling test passed");
}
