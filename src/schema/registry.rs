//! Ordered migrations and the registry built from them.

use super::{FieldDef, Schema, TableSchema};
use crate::error::{Result, StoreError};

/// One change to the declared schema.
#[derive(Clone, Debug, PartialEq)]
pub enum MigrationStep {
    CreateTable(TableSchema),
    /// Existing records are back-filled with the field's default (or null).
    AddField { table: String, field: FieldDef },
    CreateIndex { table: String, field: String },
    DropIndex { table: String, field: String },
}

/// Steps that bring the schema to `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct Migration {
    pub version: u32,
    pub steps: Vec<MigrationStep>,
}

impl Migration {
    pub fn new(version: u32, steps: Vec<MigrationStep>) -> Self {
        Self { version, steps }
    }
}

/// Declared schema: migrations in version order plus their folded result.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    migrations: Vec<Migration>,
    schema: Schema,
}

impl SchemaRegistry {
    /// Build a registry, checking that versions strictly increase from 1
    /// and that every step applies cleanly.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        let mut schema = Schema::default();

        for migration in &migrations {
            if migration.version <= schema.version {
                return Err(StoreError::InvalidSchema(format!(
                    "migration version {} does not follow version {}",
                    migration.version, schema.version
                )));
            }
            for step in &migration.steps {
                schema.apply(step)?;
            }
            schema.version = migration.version;
        }

        if schema.version == 0 {
            return Err(StoreError::InvalidSchema("no migrations declared".into()));
        }

        Ok(Self { migrations, schema })
    }

    /// Latest declared version.
    pub fn version(&self) -> u32 {
        self.schema.version
    }

    /// Effective schema at the latest version.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Migrations newer than `from`, in order.
    pub fn pending(&self, from: u32) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(move |m| m.version > from)
    }

    /// Effective schema as of `version` (the fold of migrations up to it).
    pub fn schema_at(&self, version: u32) -> Result<Schema> {
        let mut schema = Schema::default();
        for migration in self.migrations.iter().take_while(|m| m.version <= version) {
            for step in &migration.steps {
                schema.apply(step)?;
            }
            schema.version = migration.version;
        }
        Ok(schema)
    }
}
