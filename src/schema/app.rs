//! Schema of the scheduling application.

use super::{Constraint, FieldDef, Migration, MigrationStep, SchemaRegistry, TableSchema};
use crate::error::Result;
use crate::types::Value;

pub const EMPLOYEES: &str = "employees";
pub const TASKS: &str = "tasks";
pub const INVENTORY: &str = "inventory";
pub const CLOCK_RECORDS: &str = "clock_records";
pub const HOLIDAY_REQUESTS: &str = "holiday_requests";

fn one_of(values: &[&str]) -> Constraint {
    Constraint::OneOf(values.iter().map(|v| Value::from(*v)).collect())
}

/// Every migration of the application schema, oldest first.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            vec![
                MigrationStep::CreateTable(TableSchema::new(
                    EMPLOYEES,
                    vec![
                        FieldDef::text("name").constraint(Constraint::NonEmpty).indexed(),
                        FieldDef::text("position").default_value("").indexed(),
                        FieldDef::float("hourly_rate")
                            .default_value(0.0)
                            .constraint(Constraint::Min(0.0))
                            .indexed(),
                        FieldDef::text("email").default_value(""),
                        FieldDef::text("phone").default_value(""),
                        FieldDef::text("password").default_value(""),
                    ],
                )),
                MigrationStep::CreateTable(TableSchema::new(
                    TASKS,
                    vec![
                        FieldDef::text("text").constraint(Constraint::NonEmpty).indexed(),
                        FieldDef::boolean("completed").default_value(false).indexed(),
                        FieldDef::timestamp("created_at"),
                        FieldDef::timestamp("due_at").nullable().indexed(),
                        FieldDef::reference("assigned_to").nullable().indexed(),
                    ],
                )),
                MigrationStep::CreateTable(TableSchema::new(
                    INVENTORY,
                    vec![
                        FieldDef::text("name").constraint(Constraint::NonEmpty).indexed(),
                        FieldDef::int("quantity")
                            .default_value(0i64)
                            .constraint(Constraint::Min(0.0))
                            .indexed(),
                        FieldDef::float("unit_price")
                            .default_value(0.0)
                            .constraint(Constraint::Min(0.0))
                            .indexed(),
                    ],
                )),
            ],
        ),
        Migration::new(
            2,
            vec![
                MigrationStep::AddField {
                    table: EMPLOYEES.into(),
                    field: FieldDef::text("role")
                        .default_value("staff")
                        .constraint(one_of(&["superAdmin", "manager", "staff"]))
                        .indexed(),
                },
                MigrationStep::AddField {
                    table: TASKS.into(),
                    field: FieldDef::int("priority")
                        .default_value(2i64)
                        .constraint(Constraint::OneOf(vec![
                            Value::Int(1),
                            Value::Int(2),
                            Value::Int(3),
                        ]))
                        .indexed(),
                },
                MigrationStep::CreateTable(TableSchema::new(
                    CLOCK_RECORDS,
                    vec![
                        FieldDef::reference("employee_id").indexed(),
                        FieldDef::timestamp("clock_in").indexed(),
                        FieldDef::timestamp("clock_out").nullable().indexed(),
                    ],
                )),
                MigrationStep::CreateTable(TableSchema::new(
                    HOLIDAY_REQUESTS,
                    vec![
                        FieldDef::reference("employee_id").indexed(),
                        FieldDef::timestamp("start_date").indexed(),
                        FieldDef::timestamp("end_date").indexed(),
                        FieldDef::text("status")
                            .default_value("pending")
                            .constraint(one_of(&["pending", "approved", "rejected"]))
                            .indexed(),
                        FieldDef::text("reason").default_value(""),
                    ],
                )),
            ],
        ),
        Migration::new(
            3,
            vec![
                MigrationStep::CreateIndex {
                    table: EMPLOYEES.into(),
                    field: "email".into(),
                },
                MigrationStep::CreateIndex {
                    table: TASKS.into(),
                    field: "created_at".into(),
                },
            ],
        ),
    ]
}

/// Registry holding the application schema at its latest version.
pub fn registry() -> Result<SchemaRegistry> {
    SchemaRegistry::new(migrations())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_schema_declares_all_tables() {
        let registry = registry().unwrap();
        let schema = registry.schema();
        assert_eq!(registry.version(), 3);
        for table in [EMPLOYEES, TASKS, INVENTORY, CLOCK_RECORDS, HOLIDAY_REQUESTS] {
            assert!(schema.table(table).is_some(), "missing {table}");
        }
        let tasks = schema.table(TASKS).unwrap();
        assert!(tasks.field("due_at").unwrap().indexed);
        assert!(tasks.field("created_at").unwrap().indexed);
    }

    #[test]
    fn test_version_one_has_no_roles() {
        let v1 = registry().unwrap().schema_at(1).unwrap();
        assert!(v1.table(EMPLOYEES).unwrap().field("role").is_none());
        assert!(v1.table(CLOCK_RECORDS).is_none());
    }
}
