//! Access path selection.

use super::{Predicate, Query, ID_FIELD};
use crate::storage::Table;

/// How a query's candidate records are located.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessPath {
    /// Every record, id ascending, filtered in memory.
    FullScan,
    /// Filter on the record id, walked in id order.
    PrimaryKey,
    IndexEqual { field: String },
    IndexRange { field: String },
    /// Complement scan over the index, skipping the excluded value.
    IndexNotEqual { field: String },
}

impl AccessPath {
    pub fn uses_index(&self) -> bool {
        !matches!(self, AccessPath::FullScan)
    }
}

/// Pick the access path for an already-validated query.
pub fn plan(query: &Query, table: &Table) -> AccessPath {
    let Some(filter) = &query.filter else {
        return AccessPath::FullScan;
    };

    if filter.field == ID_FIELD {
        return AccessPath::PrimaryKey;
    }

    if table.indices().get(&filter.field).is_none() {
        return AccessPath::FullScan;
    }

    let field = filter.field.clone();
    match filter.predicate {
        Predicate::Equal(_) => AccessPath::IndexEqual { field },
        Predicate::NotEqual(_) => AccessPath::IndexNotEqual { field },
        Predicate::Range { .. } => AccessPath::IndexRange { field },
    }
}
