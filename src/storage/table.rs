//! Table storage.
//!
//! A table owns its records (keyed by id) and the indices over them.
//! Writes are split in two phases: `prepare_*` validates against the
//! schema without touching state, `commit_*` applies an already-validated
//! change to records and indices together. The store journals between the
//! two phases, so a failed journal write leaves the table untouched.

use super::index::IndexSet;
use super::snapshot::TableSnapshot;
use crate::error::{Result, StoreError};
use crate::schema::{FieldDef, TableSchema};
use crate::types::{Fields, Record, RecordId, Value};
use std::collections::BTreeMap;

/// Records and indices of one table.
#[derive(Debug)]
pub struct Table {
    schema: TableSchema,
    records: BTreeMap<RecordId, Fields>,
    /// Next id to assign. Never decreases during a table's lifetime.
    next_id: u64,
    indices: IndexSet,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        let indices = IndexSet::for_schema(&schema);
        Self {
            schema,
            records: BTreeMap::new(),
            next_id: 1,
            indices,
        }
    }

    /// Restore a table from a checkpoint and rebuild its indices.
    pub fn from_snapshot(schema: TableSchema, snapshot: TableSnapshot) -> Self {
        let mut table = Self::new(schema);
        table.next_id = snapshot.next_id.max(1);
        for record in snapshot.records {
            table.next_id = table.next_id.max(record.id.0 + 1);
            table.records.insert(record.id, record.fields);
        }
        table.rebuild_indices();
        table
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn indices(&self) -> &IndexSet {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_id(&self) -> RecordId {
        RecordId(self.next_id)
    }

    /// Copy of a record.
    pub fn get(&self, id: RecordId) -> Option<Record> {
        self.records.get(&id).map(|fields| Record {
            id,
            fields: fields.clone(),
        })
    }

    pub fn fields(&self, id: RecordId) -> Option<&Fields> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    /// Every record by reference, id ascending.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &Fields)> {
        self.records.iter().map(|(id, fields)| (*id, fields))
    }

    /// Copies of every record, id ascending.
    pub fn scan_all(&self) -> Vec<Record> {
        self.iter()
            .map(|(id, fields)| Record {
                id,
                fields: fields.clone(),
            })
            .collect()
    }

    // --- Validation ---

    /// Validate a new record and assign it the next id.
    pub fn prepare_add(&self, fields: Fields) -> Result<Record> {
        let fields = self.validate_full(fields)?;
        Ok(Record {
            id: RecordId(self.next_id),
            fields,
        })
    }

    /// Validate a batch; ids are assigned consecutively.
    pub fn prepare_bulk_add(&self, batch: Vec<Fields>) -> Result<Vec<Record>> {
        batch
            .into_iter()
            .enumerate()
            .map(|(offset, fields)| {
                Ok(Record {
                    id: RecordId(self.next_id + offset as u64),
                    fields: self.validate_full(fields)?,
                })
            })
            .collect()
    }

    /// Validate a partial update against an existing record.
    pub fn prepare_update(&self, id: RecordId, patch: Fields) -> Result<Fields> {
        if !self.contains(id) {
            return Err(StoreError::not_found(self.name(), id));
        }
        patch
            .into_iter()
            .map(|(name, value)| {
                let def = self.field_def(&name)?;
                Ok((name, def.check(self.name(), value)?))
            })
            .collect()
    }

    pub fn prepare_delete(&self, id: RecordId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(StoreError::not_found(self.name(), id))
        }
    }

    fn field_def(&self, name: &str) -> Result<&FieldDef> {
        if name == "id" {
            return Err(StoreError::validation(
                self.name(),
                "field 'id' is assigned by the store",
            ));
        }
        self.schema
            .field(name)
            .ok_or_else(|| StoreError::validation(self.name(), format!("unknown field '{name}'")))
    }

    fn validate_full(&self, mut fields: Fields) -> Result<Fields> {
        for name in fields.keys() {
            self.field_def(name)?;
        }

        let mut validated = Fields::new();
        for def in &self.schema.fields {
            let value = match fields.remove(&def.name) {
                Some(value) => value,
                None => def.fallback().ok_or_else(|| {
                    StoreError::validation(self.name(), format!("missing required field '{}'", def.name))
                })?,
            };
            validated.insert(def.name.clone(), def.check(self.name(), value)?);
        }
        Ok(validated)
    }

    // --- Application ---

    pub fn commit_add(&mut self, record: Record) {
        self.next_id = self.next_id.max(record.id.0 + 1);
        self.indices.on_insert(record.id, &record.fields);
        if let Some(previous) = self.records.insert(record.id, record.fields) {
            // Only reachable when replaying a journal over a snapshot that
            // already holds the record.
            self.indices.on_remove(record.id, &previous);
            let current = &self.records[&record.id];
            self.indices.on_insert(record.id, current);
        }
    }

    /// Apply a validated patch. Returns false if the record is gone.
    pub fn commit_update(&mut self, id: RecordId, patch: &Fields) -> bool {
        let Some(current) = self.records.get_mut(&id) else {
            return false;
        };
        let before = current.clone();
        for (name, value) in patch {
            current.insert(name.clone(), value.clone());
        }
        self.indices.on_update(id, &before, current);
        true
    }

    /// Remove a record. Its id is never reassigned.
    pub fn commit_delete(&mut self, id: RecordId) -> Option<Record> {
        let fields = self.records.remove(&id)?;
        self.indices.on_remove(id, &fields);
        Some(Record { id, fields })
    }

    /// Drop every record and start a new table lifetime.
    pub fn clear(&mut self) {
        self.records.clear();
        self.next_id = 1;
        self.rebuild_indices();
    }

    // --- Schema changes ---

    /// Back-fill a newly declared field on every record that lacks it.
    pub fn add_field(&mut self, field: &FieldDef) {
        let fallback = field.fallback().unwrap_or(Value::Null);
        for fields in self.records.values_mut() {
            fields
                .entry(field.name.clone())
                .or_insert_with(|| fallback.clone());
        }
        self.schema.fields.retain(|f| f.name != field.name);
        self.schema.fields.push(field.clone());
        self.rebuild_indices();
    }

    /// Replace the declarations (index set may change) and rebuild indices.
    pub fn set_schema(&mut self, schema: TableSchema) {
        self.schema = schema;
        self.indices = IndexSet::for_schema(&self.schema);
        self.rebuild_indices();
    }

    fn rebuild_indices(&mut self) {
        let Self {
            records, indices, ..
        } = self;
        indices.rebuild(records.iter().map(|(id, fields)| (*id, fields)));
    }

    /// Check index consistency against the record set.
    pub fn verify(&self) -> Result<()> {
        self.indices.verify(self.records.len(), self.iter())
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            name: self.schema.name.clone(),
            next_id: self.next_id,
            records: self.scan_all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::schema::{Constraint, FieldDef};

    fn items() -> Table {
        Table::new(TableSchema::new(
            "inventory",
            vec![
                FieldDef::text("name").constraint(Constraint::NonEmpty).indexed(),
                FieldDef::int("quantity")
                    .default_value(0i64)
                    .constraint(Constraint::Min(0.0))
                    .indexed(),
                FieldDef::float("unit_price").nullable(),
            ],
        ))
    }

    fn add(table: &mut Table, fields: Fields) -> RecordId {
        let record = table.prepare_add(fields).unwrap();
        let id = record.id;
        table.commit_add(record);
        id
    }

    #[test]
    fn test_add_fills_defaults() {
        let mut table = items();
        let id = add(&mut table, fields! { "name" => "Bolts" });
        assert_eq!(id, RecordId(1));

        let record = table.get(id).unwrap();
        assert_eq!(record.get("quantity"), &Value::Int(0));
        assert_eq!(record.get("unit_price"), &Value::Null);
    }

    #[test]
    fn test_add_rejects_missing_and_unknown_fields() {
        let table = items();
        assert!(matches!(
            table.prepare_add(fields! { "quantity" => 3i64 }),
            Err(StoreError::Validation { .. })
        ));
        assert!(table
            .prepare_add(fields! { "name" => "Nuts", "colour" => "red" })
            .is_err());
        assert!(table.prepare_add(fields! { "name" => "Nuts", "id" => 4i64 }).is_err());
    }

    #[test]
    fn test_ids_never_reused() {
        let mut table = items();
        let first = add(&mut table, fields! { "name" => "A" });
        let second = add(&mut table, fields! { "name" => "B" });
        table.commit_delete(second).unwrap();
        let third = add(&mut table, fields! { "name" => "C" });

        assert_eq!(first, RecordId(1));
        assert_eq!(third, RecordId(3));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_update_patches_only_given_fields() {
        let mut table = items();
        let id = add(&mut table, fields! { "name" => "Tape", "quantity" => 4i64 });

        let patch = table.prepare_update(id, fields! { "quantity" => 9i64 }).unwrap();
        assert!(table.commit_update(id, &patch));

        let record = table.get(id).unwrap();
        assert_eq!(record.get("name"), &Value::from("Tape"));
        assert_eq!(record.get("quantity"), &Value::Int(9));
        assert_eq!(
            table.indices().get("quantity").unwrap().lookup_eq(&Value::Int(9)),
            vec![id]
        );
        table.verify().unwrap();
    }

    #[test]
    fn test_update_validation() {
        let mut table = items();
        let id = add(&mut table, fields! { "name" => "Tape" });

        assert!(matches!(
            table.prepare_update(RecordId(42), fields! { "quantity" => 1i64 }),
            Err(StoreError::NotFound { .. })
        ));
        assert!(table.prepare_update(id, fields! { "quantity" => -1i64 }).is_err());
        assert!(table.prepare_update(id, fields! { "id" => 7i64 }).is_err());
    }

    #[test]
    fn test_bulk_add_assigns_consecutive_ids() {
        let table = items();
        let batch = table
            .prepare_bulk_add(vec![fields! { "name" => "A" }, fields! { "name" => "B" }])
            .unwrap();
        assert_eq!(batch[0].id, RecordId(1));
        assert_eq!(batch[1].id, RecordId(2));

        // One bad record rejects the whole batch.
        assert!(table
            .prepare_bulk_add(vec![fields! { "name" => "A" }, fields! { "name" => "" }])
            .is_err());
    }

    #[test]
    fn test_clear_starts_new_lifetime() {
        let mut table = items();
        add(&mut table, fields! { "name" => "A" });
        add(&mut table, fields! { "name" => "B" });
        table.clear();
        assert!(table.is_empty());
        assert_eq!(add(&mut table, fields! { "name" => "C" }), RecordId(1));
        table.verify().unwrap();
    }

    #[test]
    fn test_add_field_backfills() {
        let mut table = items();
        let id = add(&mut table, fields! { "name" => "A" });
        table.add_field(&FieldDef::boolean("archived").default_value(false).indexed());

        assert_eq!(table.get(id).unwrap().get("archived"), &Value::Bool(false));
        assert_eq!(
            table.indices().get("archived").unwrap().lookup_eq(&Value::Bool(false)),
            vec![id]
        );
    }

    #[test]
    fn test_snapshot_roundtrip_rebuilds_indices() {
        let mut table = items();
        add(&mut table, fields! { "name" => "A", "quantity" => 2i64 });
        let deleted = add(&mut table, fields! { "name" => "B" });
        table.commit_delete(deleted);

        let restored = Table::from_snapshot(table.schema().clone(), table.snapshot());
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.next_id(), RecordId(3));
        restored.verify().unwrap();
    }
}
