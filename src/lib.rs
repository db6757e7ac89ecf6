//! # Shiftstore
//!
//! A local, reactive table store for a small-business scheduling app:
//! employees, tasks, clock records, inventory and holiday requests.
//!
//! ## Core Concepts
//!
//! - **Tables**: named collections of records, declared by versioned migrations
//! - **Indices**: ordered per-field maps kept in step with every write
//! - **Queries**: one optional single-field filter, ordering, reversal, limit
//! - **Live queries**: queries that re-deliver whenever their result changes
//!
//! ## Example
//!
//! ```ignore
//! use shiftstore::{fields, Query, Store, StoreConfig, Timestamp};
//!
//! let store = Store::open_or_create(StoreConfig {
//!     path: "./my-store".into(),
//!     ..Default::default()
//! })?;
//!
//! let start = Timestamp::parse_rfc3339("2024-05-01T00:00:00Z").unwrap();
//! let end = Timestamp::parse_rfc3339("2024-05-01T23:59:00Z").unwrap();
//!
//! // Re-delivered every time the set of tasks due that day changes.
//! let sub = store.subscribe(
//!     Query::table("tasks").where_between("due_at", start, end),
//!     |tasks| println!("{} due today", tasks.len()),
//! )?;
//!
//! store.add("tasks", fields! {
//!     "text" => "Stock check",
//!     "created_at" => Timestamp::now(),
//!     "due_at" => start,
//! })?;
//!
//! store.unsubscribe(sub);
//! ```

pub mod changes;
pub mod entities;
pub mod error;
pub mod query;
pub mod schema;
pub mod seed;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use changes::{ChangeEvent, ChangeKind};
pub use entities::{
    ClockRecord, ClockRecordPatch, Employee, EmployeePatch, Entity, HolidayRequest,
    HolidayRequestPatch, HolidayStatus, InventoryItem, InventoryItemPatch, Patch, Priority, Role,
    Row, TableHandle, Task, TaskPatch,
};
pub use error::{Result, StoreError};
pub use query::{AccessPath, Filter, Predicate, Query};
pub use schema::{
    Constraint, FieldDef, FieldType, Migration, MigrationStep, Schema, SchemaRegistry, TableSchema,
};
pub use seed::SeedPolicy;
pub use store::{Store, StoreConfig};
pub use subscriptions::{
    DropReason, LiveQueryEvent, LiveQueryReceiver, LiveQueryState, SubscriptionId,
};
pub use types::*;
