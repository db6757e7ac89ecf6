//! Baseline data inserted into a fresh store.

use crate::error::Result;
use crate::fields;
use crate::schema::app;
use crate::store::Store;
use crate::types::Fields;

/// Records inserted into one table when that table is empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeedPolicy {
    pub table: String,
    pub records: Vec<Fields>,
}

impl SeedPolicy {
    /// Seed nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// One employee per role.
    pub fn baseline() -> Self {
        Self {
            table: app::EMPLOYEES.to_string(),
            records: vec![
                employee("Admin User", "Administrator", 50.0, "admin@example.com", "1234567890", "admin123", "superAdmin"),
                employee("John Doe", "Manager", 40.0, "john@example.com", "9876543210", "manager123", "manager"),
                employee("Jane Smith", "Staff", 25.0, "jane@example.com", "5555555555", "staff123", "staff"),
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert the records if the table holds none. The count check and the
    /// insert happen under one table lock, so repeated calls never
    /// duplicate the set. Returns how many records were inserted.
    pub fn apply(&self, store: &Store) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let inserted = store.bulk_add_if_empty(&self.table, self.records.clone())?;
        if inserted > 0 {
            tracing::info!(table = %self.table, records = inserted, "seeded baseline data");
        }
        Ok(inserted)
    }
}

fn employee(
    name: &str,
    position: &str,
    hourly_rate: f64,
    email: &str,
    phone: &str,
    password: &str,
    role: &str,
) -> Fields {
    fields! {
        "name" => name,
        "position" => position,
        "hourly_rate" => hourly_rate,
        "email" => email,
        "phone" => phone,
        "password" => password,
        "role" => role,
    }
}
