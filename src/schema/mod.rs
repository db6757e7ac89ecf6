//! Schema registry.
//!
//! Tables and their fields are declared through an ordered list of
//! migrations. The effective schema is the fold of every migration step;
//! its version is the version of the last migration.
//!
//! On open the store compares the persisted schema marker with the
//! registry: missing or older markers get the pending steps applied,
//! newer markers are refused.

pub mod app;
mod registry;

pub use registry::{Migration, MigrationStep, SchemaRegistry};

use crate::error::{Result, StoreError};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field type as declared in the schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Identifier of a record in another table. Not enforced.
    Ref,
}

/// Value constraint checked on every write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// Numeric value must be `>=` the bound.
    Min(f64),
    /// Value must be one of the listed values.
    OneOf(Vec<Value>),
    /// Text must contain something other than whitespace.
    NonEmpty,
}

/// A single field declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
    pub indexed: bool,
    /// Used when an add omits the field, and to back-fill on `AddField`.
    pub default: Option<Value>,
    pub constraint: Option<Constraint>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            indexed: false,
            default: None,
            constraint: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Timestamp)
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Ref)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Value stored when a write omits this field, if any.
    pub fn fallback(&self) -> Option<Value> {
        match &self.default {
            Some(v) => Some(v.clone()),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    /// Whether a value has the right shape for this field, ignoring constraints.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self.ty, value) {
            (_, Value::Null) => self.nullable,
            (FieldType::Text, Value::Text(_)) => true,
            (FieldType::Int, Value::Int(_)) => true,
            (FieldType::Float, Value::Float(_) | Value::Int(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Timestamp, Value::Timestamp(_)) => true,
            (FieldType::Ref, Value::Int(i)) => *i >= 0,
            _ => false,
        }
    }

    /// Type-check, coerce and constraint-check a value for writing.
    pub fn check(&self, table: &str, value: Value) -> Result<Value> {
        if !self.accepts(&value) {
            return Err(StoreError::validation(
                table,
                format!(
                    "field '{}' expects {:?}{}, got {}",
                    self.name,
                    self.ty,
                    if self.nullable { " or null" } else { "" },
                    value.kind()
                ),
            ));
        }

        let value = match (self.ty, value) {
            (FieldType::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, v) => v,
        };

        if value.is_null() {
            return Ok(value);
        }

        match &self.constraint {
            Some(Constraint::Min(min)) => {
                let n = value.as_f64().unwrap_or(f64::NAN);
                if !(n >= *min) {
                    return Err(StoreError::validation(
                        table,
                        format!("field '{}' must be >= {}, got {:?}", self.name, min, value),
                    ));
                }
            }
            Some(Constraint::OneOf(allowed)) => {
                if !allowed.contains(&value) {
                    return Err(StoreError::validation(
                        table,
                        format!("field '{}' must be one of {:?}, got {:?}", self.name, allowed, value),
                    ));
                }
            }
            Some(Constraint::NonEmpty) => {
                if value.as_str().map(|s| s.trim().is_empty()).unwrap_or(true) {
                    return Err(StoreError::validation(
                        table,
                        format!("field '{}' must not be empty", self.name),
                    ));
                }
            }
            None => {}
        }

        Ok(value)
    }
}

/// Declaration of one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut FieldDef> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Names of indexed fields, in declaration order.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter(|f| f.indexed).map(|f| f.name.as_str())
    }
}

/// The effective schema at a given version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Apply one migration step to the declarations.
    pub fn apply(&mut self, step: &MigrationStep) -> Result<()> {
        match step {
            MigrationStep::CreateTable(table) => {
                if self.tables.contains_key(&table.name) {
                    return Err(StoreError::InvalidSchema(format!(
                        "table '{}' declared twice",
                        table.name
                    )));
                }
                if table.field("id").is_some() {
                    return Err(StoreError::InvalidSchema(format!(
                        "table '{}' declares reserved field 'id'",
                        table.name
                    )));
                }
                self.tables.insert(table.name.clone(), table.clone());
            }
            MigrationStep::AddField { table, field } => {
                let schema = self.table_mut(table)?;
                if schema.field(&field.name).is_some() || field.name == "id" {
                    return Err(StoreError::InvalidSchema(format!(
                        "field '{}.{}' declared twice",
                        table, field.name
                    )));
                }
                if field.fallback().is_none() {
                    return Err(StoreError::InvalidSchema(format!(
                        "added field '{}.{}' needs a default or must be nullable",
                        table, field.name
                    )));
                }
                schema.fields.push(field.clone());
            }
            MigrationStep::CreateIndex { table, field } => {
                self.field_mut(table, field)?.indexed = true;
            }
            MigrationStep::DropIndex { table, field } => {
                self.field_mut(table, field)?.indexed = false;
            }
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut TableSchema> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| StoreError::InvalidSchema(format!("unknown table '{table}'")))
    }

    fn field_mut(&mut self, table: &str, field: &str) -> Result<&mut FieldDef> {
        self.table_mut(table)?
            .field_mut(field)
            .ok_or_else(|| StoreError::InvalidSchema(format!("unknown field '{table}.{field}'")))
    }
}
