//! Secondary indices over field values.
//!
//! Each indexed field maps value -> set of record ids. Iteration order is
//! value ascending, then id ascending. Null values are indexed so that
//! equality against null resolves through the index, but they never match
//! a range or not-equal lookup.

use crate::error::{Result, StoreError};
use crate::schema::TableSchema;
use crate::types::{Fields, RecordId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Ordered index over one field.
#[derive(Clone, Debug, Default)]
pub struct FieldIndex {
    field: String,
    entries: BTreeMap<Value, BTreeSet<RecordId>>,
    len: usize,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entries: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of (value, id) entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct values.
    pub fn distinct_values(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, value: Value, id: RecordId) {
        if self.entries.entry(value).or_default().insert(id) {
            self.len += 1;
        }
    }

    pub fn remove(&mut self, value: &Value, id: RecordId) {
        if let Some(ids) = self.entries.get_mut(value) {
            if ids.remove(&id) {
                self.len -= 1;
            }
            if ids.is_empty() {
                self.entries.remove(value);
            }
        }
    }

    /// Ids whose value equals `value`, ascending.
    pub fn lookup_eq(&self, value: &Value) -> Vec<RecordId> {
        self.entries
            .get(value)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids whose non-null value lies within the bounds, in index order.
    pub fn lookup_range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Vec<RecordId> {
        if is_empty_range(lower, upper) {
            return Vec::new();
        }
        self.entries
            .range::<Value, _>((lower, upper))
            .filter(|(value, _)| !value.is_null())
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Ids whose non-null value differs from `value`, in index order.
    pub fn lookup_not_eq(&self, value: &Value) -> Vec<RecordId> {
        self.entries
            .iter()
            .filter(|(v, _)| !v.is_null() && *v != value)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    fn contains(&self, value: &Value, id: RecordId) -> bool {
        self.entries.get(value).is_some_and(|ids| ids.contains(&id))
    }
}

/// `BTreeMap::range` panics on inverted bounds; those ranges are simply empty.
fn is_empty_range(lower: Bound<&Value>, upper: Bound<&Value>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

/// All secondary indices of one table.
#[derive(Clone, Debug, Default)]
pub struct IndexSet {
    indices: BTreeMap<String, FieldIndex>,
}

impl IndexSet {
    /// Empty indices for every indexed field of the schema.
    pub fn for_schema(schema: &TableSchema) -> Self {
        let indices = schema
            .indexed_fields()
            .map(|field| (field.to_string(), FieldIndex::new(field)))
            .collect();
        Self { indices }
    }

    pub fn get(&self, field: &str) -> Option<&FieldIndex> {
        self.indices.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.indices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn on_insert(&mut self, id: RecordId, fields: &Fields) {
        for (name, index) in self.indices.iter_mut() {
            index.insert(field_value(fields, name), id);
        }
    }

    pub fn on_remove(&mut self, id: RecordId, fields: &Fields) {
        for (name, index) in self.indices.iter_mut() {
            index.remove(&field_value(fields, name), id);
        }
    }

    /// Move entries whose indexed value changed between `old` and `new`.
    pub fn on_update(&mut self, id: RecordId, old: &Fields, new: &Fields) {
        for (name, index) in self.indices.iter_mut() {
            let before = field_value(old, name);
            let after = field_value(new, name);
            if before != after {
                index.remove(&before, id);
                index.insert(after, id);
            }
        }
    }

    /// Rebuild every index from scratch.
    pub fn rebuild<'a>(&mut self, records: impl Iterator<Item = (RecordId, &'a Fields)>) {
        for index in self.indices.values_mut() {
            *index = FieldIndex::new(index.field.clone());
        }
        for (id, fields) in records {
            self.on_insert(id, fields);
        }
    }

    /// Check that every index holds exactly one entry per record, under the
    /// record's current value.
    pub fn verify<'a>(
        &self,
        count: usize,
        mut records: impl Iterator<Item = (RecordId, &'a Fields)>,
    ) -> Result<()> {
        for index in self.indices.values() {
            if index.len() != count {
                return Err(StoreError::Corruption(format!(
                    "index '{}' holds {} entries for {} records",
                    index.field,
                    index.len(),
                    count
                )));
            }
        }
        records.try_for_each(|(id, fields)| {
            for (name, index) in &self.indices {
                if !index.contains(&field_value(fields, name), id) {
                    return Err(StoreError::Corruption(format!(
                        "index '{name}' is missing record {id}"
                    )));
                }
            }
            Ok(())
        })
    }
}

fn field_value(fields: &Fields, name: &str) -> Value {
    fields.get(name).cloned().unwrap_or(Value::Null)
}
