//! Typed access to the application tables.
//!
//! Each entity maps to one table of [`schema::app`](crate::schema::app).
//! Partial updates go through a per-entity patch type that lists only the
//! fields that may change independently; `Option<Option<T>>` fields clear a
//! nullable value with `Some(None)`.

use crate::error::{Result, StoreError};
use crate::query::Query;
use crate::schema::app;
use crate::store::Store;
use crate::subscriptions::SubscriptionId;
use crate::types::{Fields, Record, RecordId, Timestamp, Value};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

/// A record type bound to one table.
pub trait Entity: Sized + Send + 'static {
    const TABLE: &'static str;
    type Patch: Patch;

    fn into_fields(self) -> Fields;
    fn from_fields(fields: &Fields) -> Result<Self>;
}

/// Partial update for an entity.
pub trait Patch {
    /// Only the fields that are set.
    fn into_fields(self) -> Fields;
}

/// A decoded record together with its id.
#[derive(Clone, Debug, PartialEq)]
pub struct Row<E> {
    pub id: RecordId,
    pub value: E,
}

impl<E> Deref for Row<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.value
    }
}

impl<E: Entity> Row<E> {
    pub fn from_record(record: &Record) -> Result<Self> {
        Ok(Row {
            id: record.id,
            value: E::from_fields(&record.fields)?,
        })
    }
}

/// Typed view of one table. Obtained from [`Store::table`].
pub struct TableHandle<'a, E> {
    store: &'a Store,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, E: Entity> TableHandle<'a, E> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    /// A query over this table with no filter.
    pub fn select(&self) -> Query {
        Query::table(E::TABLE)
    }

    pub fn add(&self, entity: E) -> Result<RecordId> {
        self.store.add(E::TABLE, entity.into_fields())
    }

    pub fn bulk_add(&self, entities: Vec<E>) -> Result<Vec<RecordId>> {
        self.store
            .bulk_add(E::TABLE, entities.into_iter().map(Entity::into_fields).collect())
    }

    pub fn get(&self, id: RecordId) -> Result<Row<E>> {
        Row::from_record(&self.store.get(E::TABLE, id)?)
    }

    pub fn update(&self, id: RecordId, patch: E::Patch) -> Result<()> {
        self.store.update(E::TABLE, id, patch.into_fields())
    }

    pub fn delete(&self, id: RecordId) -> Result<()> {
        self.store.delete(E::TABLE, id)
    }

    pub fn all(&self) -> Result<Vec<Row<E>>> {
        self.query(self.select())
    }

    pub fn query(&self, query: Query) -> Result<Vec<Row<E>>> {
        self.check_table(&query)?;
        decode_all(&self.store.query(&query)?)
    }

    pub fn first(&self, query: Query) -> Result<Option<Row<E>>> {
        self.check_table(&query)?;
        self.store
            .first(query)?
            .map(|record| Row::from_record(&record))
            .transpose()
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count(E::TABLE)
    }

    /// Live query delivering decoded rows.
    pub fn subscribe<F>(&self, query: Query, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&[Row<E>]) + Send + Sync + 'static,
    {
        self.check_table(&query)?;
        self.store.subscribe(query, move |records| match decode_all::<E>(records) {
            Ok(rows) => callback(&rows),
            Err(e) => tracing::error!(table = E::TABLE, error = %e, "live query result does not decode"),
        })
    }

    fn check_table(&self, query: &Query) -> Result<()> {
        if query.table == E::TABLE {
            Ok(())
        } else {
            Err(StoreError::QueryDefinition(format!(
                "query on '{}' used with the '{}' table",
                query.table,
                E::TABLE
            )))
        }
    }
}

fn decode_all<E: Entity>(records: &[Record]) -> Result<Vec<Row<E>>> {
    records.iter().map(Row::from_record).collect()
}

// --- Field decoding ---

fn field<'f>(fields: &'f Fields, table: &str, name: &str) -> Result<&'f Value> {
    fields
        .get(name)
        .ok_or_else(|| StoreError::Deserialization(format!("{table}: missing field '{name}'")))
}

fn mismatch(table: &str, name: &str, expected: &str, got: &Value) -> StoreError {
    StoreError::Deserialization(format!(
        "{table}: field '{name}' expected {expected}, got {}",
        got.kind()
    ))
}

fn text(fields: &Fields, table: &str, name: &str) -> Result<String> {
    let value = field(fields, table, name)?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| mismatch(table, name, "text", value))
}

fn int(fields: &Fields, table: &str, name: &str) -> Result<i64> {
    let value = field(fields, table, name)?;
    value.as_i64().ok_or_else(|| mismatch(table, name, "int", value))
}

fn float(fields: &Fields, table: &str, name: &str) -> Result<f64> {
    let value = field(fields, table, name)?;
    value.as_f64().ok_or_else(|| mismatch(table, name, "float", value))
}

fn boolean(fields: &Fields, table: &str, name: &str) -> Result<bool> {
    let value = field(fields, table, name)?;
    value.as_bool().ok_or_else(|| mismatch(table, name, "bool", value))
}

fn timestamp(fields: &Fields, table: &str, name: &str) -> Result<Timestamp> {
    let value = field(fields, table, name)?;
    value
        .as_timestamp()
        .ok_or_else(|| mismatch(table, name, "timestamp", value))
}

fn opt_timestamp(fields: &Fields, table: &str, name: &str) -> Result<Option<Timestamp>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => timestamp(fields, table, name).map(Some),
    }
}

fn reference(fields: &Fields, table: &str, name: &str) -> Result<RecordId> {
    let value = field(fields, table, name)?;
    value
        .as_record_id()
        .ok_or_else(|| mismatch(table, name, "record id", value))
}

fn opt_reference(fields: &Fields, table: &str, name: &str) -> Result<Option<RecordId>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => reference(fields, table, name).map(Some),
    }
}

/// Collect the set fields of a patch.
macro_rules! patch_fields {
    ($patch:expr; $($name:ident),+ $(,)?) => {{
        let patch = $patch;
        let mut fields = Fields::new();
        $(
            if let Some(value) = patch.$name {
                fields.insert(stringify!($name).to_string(), Value::from(value));
            }
        )+
        fields
    }};
}

// --- Enumerations ---

/// Access level of an employee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    SuperAdmin,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "superAdmin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "superAdmin" => Some(Role::SuperAdmin),
            "manager" => Some(Role::Manager),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Role> for Value {
    fn from(role: Role) -> Self {
        Value::from(role.as_str())
    }
}

/// Task priority. Lower numbers sort first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn from_i64(n: i64) -> Option<Self> {
        match n {
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl From<Priority> for Value {
    fn from(priority: Priority) -> Self {
        Value::Int(priority as i64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HolidayStatus {
    Pending,
    Approved,
    Rejected,
}

impl HolidayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HolidayStatus::Pending => "pending",
            HolidayStatus::Approved => "approved",
            HolidayStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(HolidayStatus::Pending),
            "approved" => Some(HolidayStatus::Approved),
            "rejected" => Some(HolidayStatus::Rejected),
            _ => None,
        }
    }
}

impl From<HolidayStatus> for Value {
    fn from(status: HolidayStatus) -> Self {
        Value::from(status.as_str())
    }
}

// --- Employees ---

#[derive(Clone, Debug, PartialEq)]
pub struct Employee {
    pub name: String,
    pub position: String,
    pub hourly_rate: f64,
    pub email: String,
    pub phone: String,
    pub password: String,
    pub role: Role,
}

impl Employee {
    /// A staff member with empty contact details.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            position: String::new(),
            hourly_rate: 0.0,
            email: String::new(),
            phone: String::new(),
            password: String::new(),
            role,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmployeePatch {
    pub name: Option<String>,
    pub position: Option<String>,
    pub hourly_rate: Option<f64>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
    pub role: Option<Role>,
}

impl Patch for EmployeePatch {
    fn into_fields(self) -> Fields {
        patch_fields!(self; name, position, hourly_rate, email, phone, password, role)
    }
}

impl Entity for Employee {
    const TABLE: &'static str = app::EMPLOYEES;
    type Patch = EmployeePatch;

    fn into_fields(self) -> Fields {
        crate::fields! {
            "name" => self.name,
            "position" => self.position,
            "hourly_rate" => self.hourly_rate,
            "email" => self.email,
            "phone" => self.phone,
            "password" => self.password,
            "role" => self.role,
        }
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let t = Self::TABLE;
        let role = text(fields, t, "role")?;
        Ok(Self {
            name: text(fields, t, "name")?,
            position: text(fields, t, "position")?,
            hourly_rate: float(fields, t, "hourly_rate")?,
            email: text(fields, t, "email")?,
            phone: text(fields, t, "phone")?,
            password: text(fields, t, "password")?,
            role: Role::parse(&role)
                .ok_or_else(|| StoreError::Deserialization(format!("{t}: unknown role '{role}'")))?,
        })
    }
}

// --- Tasks ---

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub text: String,
    pub completed: bool,
    pub created_at: Timestamp,
    pub due_at: Option<Timestamp>,
    /// Not checked against the employees table.
    pub assigned_to: Option<RecordId>,
    pub priority: Priority,
}

impl Task {
    /// An open, unassigned, medium-priority task created now.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completed: false,
            created_at: Timestamp::now(),
            due_at: None,
            assigned_to: None,
            priority: Priority::Medium,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
    pub due_at: Option<Option<Timestamp>>,
    pub assigned_to: Option<Option<RecordId>>,
    pub priority: Option<Priority>,
}

impl Patch for TaskPatch {
    fn into_fields(self) -> Fields {
        patch_fields!(self; text, completed, due_at, assigned_to, priority)
    }
}

impl Entity for Task {
    const TABLE: &'static str = app::TASKS;
    type Patch = TaskPatch;

    fn into_fields(self) -> Fields {
        crate::fields! {
            "text" => self.text,
            "completed" => self.completed,
            "created_at" => self.created_at,
            "due_at" => self.due_at,
            "assigned_to" => self.assigned_to,
            "priority" => self.priority,
        }
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let t = Self::TABLE;
        let priority = int(fields, t, "priority")?;
        Ok(Self {
            text: text(fields, t, "text")?,
            completed: boolean(fields, t, "completed")?,
            created_at: timestamp(fields, t, "created_at")?,
            due_at: opt_timestamp(fields, t, "due_at")?,
            assigned_to: opt_reference(fields, t, "assigned_to")?,
            priority: Priority::from_i64(priority).ok_or_else(|| {
                StoreError::Deserialization(format!("{t}: unknown priority {priority}"))
            })?,
        })
    }
}

// --- Clock records ---

#[derive(Clone, Debug, PartialEq)]
pub struct ClockRecord {
    pub employee_id: RecordId,
    pub clock_in: Timestamp,
    /// `None` while the shift is open.
    pub clock_out: Option<Timestamp>,
}

impl ClockRecord {
    pub fn clock_in(employee_id: RecordId, at: Timestamp) -> Self {
        Self {
            employee_id,
            clock_in: at,
            clock_out: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.clock_out.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClockRecordPatch {
    pub clock_out: Option<Option<Timestamp>>,
}

impl Patch for ClockRecordPatch {
    fn into_fields(self) -> Fields {
        patch_fields!(self; clock_out)
    }
}

impl Entity for ClockRecord {
    const TABLE: &'static str = app::CLOCK_RECORDS;
    type Patch = ClockRecordPatch;

    fn into_fields(self) -> Fields {
        crate::fields! {
            "employee_id" => self.employee_id,
            "clock_in" => self.clock_in,
            "clock_out" => self.clock_out,
        }
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let t = Self::TABLE;
        Ok(Self {
            employee_id: reference(fields, t, "employee_id")?,
            clock_in: timestamp(fields, t, "clock_in")?,
            clock_out: opt_timestamp(fields, t, "clock_out")?,
        })
    }
}

// --- Inventory ---

#[derive(Clone, Debug, PartialEq)]
pub struct InventoryItem {
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InventoryItemPatch {
    pub name: Option<String>,
    pub quantity: Option<i64>,
    pub unit_price: Option<f64>,
}

impl Patch for InventoryItemPatch {
    fn into_fields(self) -> Fields {
        patch_fields!(self; name, quantity, unit_price)
    }
}

impl Entity for InventoryItem {
    const TABLE: &'static str = app::INVENTORY;
    type Patch = InventoryItemPatch;

    fn into_fields(self) -> Fields {
        crate::fields! {
            "name" => self.name,
            "quantity" => self.quantity,
            "unit_price" => self.unit_price,
        }
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let t = Self::TABLE;
        Ok(Self {
            name: text(fields, t, "name")?,
            quantity: int(fields, t, "quantity")?,
            unit_price: float(fields, t, "unit_price")?,
        })
    }
}

// --- Holiday requests ---

#[derive(Clone, Debug, PartialEq)]
pub struct HolidayRequest {
    pub employee_id: RecordId,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
    pub status: HolidayStatus,
    pub reason: String,
}

impl HolidayRequest {
    pub fn new(employee_id: RecordId, start_date: Timestamp, end_date: Timestamp) -> Self {
        Self {
            employee_id,
            start_date,
            end_date,
            status: HolidayStatus::Pending,
            reason: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HolidayRequestPatch {
    pub start_date: Option<Timestamp>,
    pub end_date: Option<Timestamp>,
    pub status: Option<HolidayStatus>,
    pub reason: Option<String>,
}

impl Patch for HolidayRequestPatch {
    fn into_fields(self) -> Fields {
        patch_fields!(self; start_date, end_date, status, reason)
    }
}

impl Entity for HolidayRequest {
    const TABLE: &'static str = app::HOLIDAY_REQUESTS;
    type Patch = HolidayRequestPatch;

    fn into_fields(self) -> Fields {
        crate::fields! {
            "employee_id" => self.employee_id,
            "start_date" => self.start_date,
            "end_date" => self.end_date,
            "status" => self.status,
            "reason" => self.reason,
        }
    }

    fn from_fields(fields: &Fields) -> Result<Self> {
        let t = Self::TABLE;
        let status = text(fields, t, "status")?;
        Ok(Self {
            employee_id: reference(fields, t, "employee_id")?,
            start_date: timestamp(fields, t, "start_date")?,
            end_date: timestamp(fields, t, "end_date")?,
            status: HolidayStatus::parse(&status).ok_or_else(|| {
                StoreError::Deserialization(format!("{t}: unknown status '{status}'"))
            })?,
            reason: text(fields, t, "reason")?,
        })
    }
}
