//! Query evaluation against a single table.

use super::planner::{plan, AccessPath};
use super::{compare_by, field_value, Filter, Predicate, Query};
use crate::error::{Result, StoreError};
use crate::storage::Table;
use crate::types::{Record, RecordId};

/// Run a validated query against `table`.
///
/// Results come back in the access path's natural order (index value then
/// id, or id for scans) unless `order_by` is given, in which case they are
/// stably sorted by that field. Reversal applies to the whole sequence and
/// the limit is taken last.
pub fn execute(query: &Query, table: &Table) -> Result<Vec<Record>> {
    let mut results = match (plan(query, table), &query.filter) {
        (AccessPath::PrimaryKey, Some(Filter { predicate: Predicate::Equal(value), .. })) => value
            .as_record_id()
            .and_then(|id| table.get(id))
            .into_iter()
            .collect(),
        (AccessPath::FullScan, _) | (AccessPath::PrimaryKey, _) => scan(query, table),
        (path, Some(filter)) => {
            let index = table.indices().get(&filter.field).ok_or_else(|| {
                StoreError::Corruption(format!(
                    "planned index on '{}.{}' does not exist",
                    table.name(),
                    filter.field
                ))
            })?;
            let ids = match (&path, &filter.predicate) {
                (AccessPath::IndexEqual { .. }, Predicate::Equal(value)) => index.lookup_eq(value),
                (AccessPath::IndexNotEqual { .. }, Predicate::NotEqual(value)) => {
                    index.lookup_not_eq(value)
                }
                (AccessPath::IndexRange { .. }, Predicate::Range { lower, upper }) => {
                    index.lookup_range(lower.as_ref(), upper.as_ref())
                }
                _ => {
                    return Err(StoreError::Corruption(format!(
                        "access path {path:?} does not match filter on '{}'",
                        filter.field
                    )))
                }
            };
            fetch(table, ids)?
        }
        (_, None) => scan(query, table),
    };

    if let Some(field) = &query.order_by {
        results.sort_by(|a, b| compare_by(field, a, b));
    }
    if query.reverse {
        results.reverse();
    }
    if let Some(limit) = query.limit {
        results.truncate(limit);
    }

    Ok(results)
}

fn scan(query: &Query, table: &Table) -> Vec<Record> {
    let Some(filter) = &query.filter else {
        return table.scan_all();
    };
    table
        .iter()
        .map(|(id, fields)| Record {
            id,
            fields: fields.clone(),
        })
        .filter(|record| filter.predicate.matches(&field_value(record, &filter.field)))
        .collect()
}

fn fetch(table: &Table, ids: Vec<RecordId>) -> Result<Vec<Record>> {
    ids.into_iter()
        .map(|id| {
            table.get(id).ok_or_else(|| {
                StoreError::Corruption(format!(
                    "index on '{}' references missing record {}",
                    table.name(),
                    id
                ))
            })
        })
        .collect()
}
