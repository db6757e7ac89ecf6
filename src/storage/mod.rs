//! Table storage, secondary indices and on-disk persistence.
//!
//! Indices live only in memory and are rebuilt from the records whenever
//! a table is loaded.

mod index;
mod journal;
mod snapshot;
mod table;

pub use index::{FieldIndex, IndexSet};
pub use journal::{Journal, JournalEntry, JournalOp};
pub use snapshot::{SnapshotFile, TableSnapshot};
pub use table::Table;
