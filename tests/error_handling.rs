//! Error handling tests.
//!
//! Covers rejected writes, bad query definitions, and damaged store files.

use shiftstore::schema::app;
use shiftstore::{
    fields, Query, RecordId, SeedPolicy, Store, StoreConfig, StoreError, Task, Timestamp, Value,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("store"),
        seed: false,
        ..Default::default()
    }
}

fn test_store(dir: &TempDir) -> Store {
    Store::open_or_create(test_config(dir)).unwrap()
}

// --- Validation ---

#[test]
fn test_missing_required_field() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let result = store.add(app::TASKS, fields! { "text" => "No timestamp" });
    match result {
        Err(StoreError::Validation { table, message }) => {
            assert_eq!(table, app::TASKS);
            assert!(message.contains("created_at"), "message: {message}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(store.count(app::TASKS).unwrap(), 0);
}

#[test]
fn test_wrong_type_and_constraints() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let cases = vec![
        fields! { "name" => "Bolts", "quantity" => "ten" },
        fields! { "name" => "Bolts", "quantity" => -3i64 },
        fields! { "name" => "   " },
        fields! { "name" => "Bolts", "colour" => "red" },
        fields! { "name" => "Bolts", "id" => 7i64 },
    ];
    for case in cases {
        let err = store.add(app::INVENTORY, case.clone()).unwrap_err();
        assert!(
            matches!(err, StoreError::Validation { .. }),
            "{case:?} gave {err:?}"
        );
        assert!(err.is_recoverable());
    }

    let err = store
        .add(app::EMPLOYEES, fields! { "name" => "Sam", "role" => "owner" })
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation { .. }));
}

#[test]
fn test_invalid_patch_leaves_record_unchanged() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let id = store
        .add(
            app::TASKS,
            fields! { "text" => "Mop floor", "created_at" => Timestamp(10) },
        )
        .unwrap();

    let err = store
        .update(
            app::TASKS,
            id,
            fields! { "completed" => true, "priority" => 9i64 },
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation { .. }));

    let record = store.get(app::TASKS, id).unwrap();
    assert_eq!(record.get("completed"), &Value::Bool(false));
    assert_eq!(record.get("priority"), &Value::Int(2));
}

#[test]
fn test_invalid_batch_is_rejected_whole() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let batch = vec![
        fields! { "name" => "Gloves", "quantity" => 4i64 },
        fields! { "name" => "", "quantity" => 1i64 },
    ];
    assert!(matches!(
        store.bulk_add(app::INVENTORY, batch),
        Err(StoreError::Validation { .. })
    ));
    assert_eq!(store.count(app::INVENTORY).unwrap(), 0);

    // Ids were not consumed by the rejected batch.
    let id = store
        .add(app::INVENTORY, fields! { "name" => "Gloves" })
        .unwrap();
    assert_eq!(id, RecordId(1));
}

// --- Missing Records and Tables ---

#[test]
fn test_not_found() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let err = store.get(app::TASKS, RecordId(42)).unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound { ref table, id: RecordId(42) } if table == app::TASKS
    ));
    assert!(store
        .update(app::TASKS, RecordId(42), fields! { "completed" => true })
        .is_err());
    assert!(matches!(
        store.delete(app::TASKS, RecordId(42)),
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        store.table::<Task>().get(RecordId(42)),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn test_unknown_table() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert!(matches!(
        store.add("payroll", fields! { "amount" => 1.0 }),
        Err(StoreError::UnknownTable(_))
    ));
    assert!(matches!(
        store.scan_all("payroll"),
        Err(StoreError::UnknownTable(_))
    ));
}

// --- Query Definitions ---

#[test]
fn test_bad_queries_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let queries = vec![
        Query::table("payroll"),
        Query::table(app::TASKS).where_eq("colour", "red"),
        Query::table(app::TASKS).order_by("colour"),
        Query::table(app::TASKS).where_eq("completed", "yes"),
        Query::table(app::TASKS).where_between("due_at", 1i64, 2i64),
        Query::table(app::TASKS).where_between("due_at", Value::Null, Timestamp(5)),
    ];
    for query in queries {
        let err = store.query(&query).unwrap_err();
        assert!(
            matches!(err, StoreError::QueryDefinition(_)),
            "{query:?} gave {err:?}"
        );
        assert!(matches!(
            store.subscribe(query, |_| {}),
            Err(StoreError::QueryDefinition(_))
        ));
    }
    assert_eq!(store.stats().unwrap().subscription_count, 0);
}

#[test]
fn test_query_on_wrong_entity_table() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let tasks = store.table::<Task>();
    assert!(matches!(
        tasks.query(Query::table(app::EMPLOYEES)),
        Err(StoreError::QueryDefinition(_))
    ));
}

// --- Store Files ---

#[test]
fn test_locked_store() {
    let dir = TempDir::new().unwrap();
    let _store = test_store(&dir);

    let err = Store::open_or_create(test_config(&dir)).err().unwrap();
    assert!(matches!(err, StoreError::Locked));
    assert!(err.is_storage_fault());
}

#[test]
fn test_not_initialized() {
    let dir = TempDir::new().unwrap();
    let result = Store::open_or_create(StoreConfig {
        create_if_missing: false,
        ..test_config(&dir)
    });
    assert!(matches!(result, Err(StoreError::NotInitialized)));
}

#[test]
fn test_bad_manifest() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    test_store(&dir).close().unwrap();

    fs::write(config.path.join("MANIFEST"), b"NOPE\x01").unwrap();

    let err = Store::open_or_create(config).err().unwrap();
    assert!(matches!(err, StoreError::InvalidFormat(_)));
    assert!(err.is_storage_fault());
}

#[test]
fn test_corrupt_snapshot() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    {
        let store = test_store(&dir);
        store
            .add(app::INVENTORY, fields! { "name" => "Bolts" })
            .unwrap();
        store.close().unwrap();
    }

    // Flip a byte inside the payload.
    let path = config.path.join("tables.snap");
    let mut bytes = fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let err = Store::open_or_create(config).err().unwrap();
    assert!(err.is_storage_fault(), "got {err:?}");
    assert!(!err.is_recoverable());
}

#[test]
fn test_corrupt_schema_marker() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    test_store(&dir).close().unwrap();

    fs::write(config.path.join("schema.json"), b"{ not json").unwrap();

    assert!(matches!(
        Store::open_or_create(config),
        Err(StoreError::Corruption(_))
    ));
}

#[test]
fn test_journal_garbage_is_discarded() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    test_store(&dir).close().unwrap();

    let mut journal = OpenOptions::new()
        .append(true)
        .open(config.path.join("journal.log"))
        .unwrap();
    journal.write_all(&[0xAB; 13]).unwrap();
    drop(journal);

    let store = Store::open_or_create(config).unwrap();
    assert_eq!(store.count(app::INVENTORY).unwrap(), 0);
    store.verify().unwrap();
}

#[test]
fn test_newer_schema_is_refused() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    test_store(&dir).close().unwrap();

    let older = shiftstore::SchemaRegistry::new(app::migrations().into_iter().take(1).collect())
        .unwrap();
    let err = Store::open_with(config, older, SeedPolicy::empty())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        StoreError::SchemaTooNew {
            on_disk: 3,
            known: 1
        }
    ));
    assert!(!err.is_recoverable());
    assert!(!err.is_storage_fault());
}
