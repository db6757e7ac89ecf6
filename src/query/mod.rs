//! Query definitions and evaluation.
//!
//! A query reads one table with at most one single-field filter
//! (equality, not-equal or range), an optional ordering field, an optional
//! reversal and an optional limit.
//!
//! Filters on indexed fields resolve through the index; anything else
//! falls back to a full scan. Ordering is a stable sort, so ties keep the
//! order the access path produced (index order, or id order for scans).
//!
//! A null field value satisfies only `Equal(Null)`.

mod executor;
mod planner;

pub use executor::execute;
pub use planner::{plan, AccessPath};

use crate::error::{Result, StoreError};
use crate::schema::{FieldType, Schema};
use crate::types::{Record, Value};
use std::cmp::Ordering;
use std::ops::Bound;

/// Pseudo-field naming the record id in filters and ordering.
pub const ID_FIELD: &str = "id";

/// Condition on a single field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Equal(Value),
    NotEqual(Value),
    Range { lower: Bound<Value>, upper: Bound<Value> },
}

impl Predicate {
    /// Inclusive on both ends.
    pub fn between(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Predicate::Range {
            lower: Bound::Included(lower.into()),
            upper: Bound::Included(upper.into()),
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::Equal(expected) => value == expected,
            Predicate::NotEqual(_) | Predicate::Range { .. } if value.is_null() => false,
            Predicate::NotEqual(excluded) => value != excluded,
            Predicate::Range { lower, upper } => {
                let lower_ok = match lower {
                    Bound::Included(l) => value >= l,
                    Bound::Excluded(l) => value > l,
                    Bound::Unbounded => true,
                };
                let upper_ok = match upper {
                    Bound::Included(u) => value <= u,
                    Bound::Excluded(u) => value < u,
                    Bound::Unbounded => true,
                };
                lower_ok && upper_ok
            }
        }
    }
}

/// Predicate applied to a named field.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: String,
    pub predicate: Predicate,
}

/// A one-shot or live query against a single table.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub table: String,
    pub filter: Option<Filter>,
    pub order_by: Option<String>,
    /// Reverse the whole result after ordering.
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl Query {
    /// Every record of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            order_by: None,
            reverse: false,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.filter = Some(Filter {
            field: field.into(),
            predicate,
        });
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Predicate::Equal(value.into()))
    }

    pub fn where_not_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Predicate::NotEqual(value.into()))
    }

    /// Inclusive range on both ends.
    pub fn where_between(
        self,
        field: impl Into<String>,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Self {
        self.filter(field, Predicate::between(lower, upper))
    }

    pub fn where_range(self, field: impl Into<String>, lower: Bound<Value>, upper: Bound<Value>) -> Self {
        self.filter(field, Predicate::Range { lower, upper })
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject references to unknown tables or fields, and filter values of
    /// the wrong type.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        let table = schema.table(&self.table).ok_or_else(|| {
            StoreError::QueryDefinition(format!("unknown table '{}'", self.table))
        })?;

        let field_type = |name: &str| -> Result<(FieldType, bool)> {
            if name == ID_FIELD {
                return Ok((FieldType::Ref, false));
            }
            table
                .field(name)
                .map(|f| (f.ty, f.nullable))
                .ok_or_else(|| {
                    StoreError::QueryDefinition(format!("unknown field '{}.{}'", self.table, name))
                })
        };

        if let Some(filter) = &self.filter {
            let (ty, _) = field_type(&filter.field)?;
            let check = |value: &Value, allow_null: bool| -> Result<()> {
                if value.is_null() && allow_null || value_fits(ty, value) {
                    Ok(())
                } else {
                    Err(StoreError::QueryDefinition(format!(
                        "filter on '{}.{}' compares {:?} with a {} value",
                        self.table,
                        filter.field,
                        ty,
                        value.kind()
                    )))
                }
            };
            match &filter.predicate {
                Predicate::Equal(v) | Predicate::NotEqual(v) => check(v, true)?,
                Predicate::Range { lower, upper } => {
                    for bound in [lower, upper] {
                        if let Bound::Included(v) | Bound::Excluded(v) = bound {
                            check(v, false)?;
                        }
                    }
                }
            }
        }

        if let Some(field) = &self.order_by {
            field_type(field)?;
        }

        Ok(())
    }
}

fn value_fits(ty: FieldType, value: &Value) -> bool {
    matches!(
        (ty, value),
        (FieldType::Text, Value::Text(_))
            | (FieldType::Int, Value::Int(_))
            | (FieldType::Float, Value::Float(_) | Value::Int(_))
            | (FieldType::Bool, Value::Bool(_))
            | (FieldType::Timestamp, Value::Timestamp(_))
            | (FieldType::Ref, Value::Int(_))
    )
}

/// Value of `field` on a record, treating `id` as a field.
pub(crate) fn field_value(record: &Record, field: &str) -> Value {
    if field == ID_FIELD {
        Value::from(record.id)
    } else {
        record.get(field).clone()
    }
}

pub(crate) fn compare_by(field: &str, a: &Record, b: &Record) -> Ordering {
    if field == ID_FIELD {
        a.id.cmp(&b.id)
    } else {
        a.get(field).cmp(b.get(field))
    }
}
