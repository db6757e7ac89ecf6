//! Main Store struct tying all components together.

use crate::changes::{ChangeEvent, ChangeKind, ChangeLog};
use crate::entities::{Entity, TableHandle};
use crate::error::{Result, StoreError};
use crate::query::{self, AccessPath, Query};
use crate::schema::{app, MigrationStep, Schema, SchemaRegistry};
use crate::seed::SeedPolicy;
use crate::storage::{Journal, JournalEntry, JournalOp, SnapshotFile, Table, TableSnapshot};
use crate::subscriptions::{
    LiveQueryReceiver, LiveQueryState, QuerySource, SubscriptionId, SubscriptionManager,
};
use crate::types::{Fields, Record, RecordId, StoreStats};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the store files.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the journal every N entries (0 and 1 both mean every entry).
    pub sync_interval: u64,

    /// Journal entries after which a checkpoint is written.
    /// 0 disables automatic checkpoints.
    pub checkpoint_every: u64,

    /// Number of recent change events kept for introspection.
    pub change_log_capacity: usize,

    /// Insert baseline data into a freshly created store.
    pub seed: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./shiftstore"),
            create_if_missing: true,
            sync_interval: 1,
            checkpoint_every: 1000,
            change_log_capacity: 256,
            seed: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"SHS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const SCHEMA_FILE: &str = "schema.json";
const SNAPSHOT_FILE: &str = "tables.snap";
const JOURNAL_FILE: &str = "journal.log";

/// The reactive table store.
///
/// Every table is guarded by its own lock: a mutation validates, journals
/// and applies under that table's write lock, so readers never observe a
/// partial change. Live queries over the table are re-run after the lock is
/// released and before the mutating call returns.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Effective schema, fixed after open.
    schema: Schema,

    /// One entry per declared table; the key set never changes after open.
    tables: BTreeMap<String, RwLock<Table>>,

    /// Checkpointed tables the schema does not declare. Carried through
    /// every checkpoint untouched.
    orphans: Vec<TableSnapshot>,

    journal: Journal,
    snapshot: SnapshotFile,
    changes: ChangeLog,
    subscriptions: SubscriptionManager,
    seed: SeedPolicy,

    /// Serializes checkpoints.
    checkpoint_lock: Mutex<()>,
}

impl Store {
    /// Open the application store, creating and seeding it if needed.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        Self::open_with(config, app::registry()?, SeedPolicy::baseline())
    }

    /// Open a store with an explicit schema registry and seed policy.
    pub fn open_with(config: StoreConfig, registry: SchemaRegistry, seed: SeedPolicy) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::verify_manifest(&config.path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        } else {
            return Err(StoreError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let marker = Self::read_schema_marker(&config.path)?;
        let fresh = marker.is_none();
        let mut schema = marker.unwrap_or_default();
        if schema.version > registry.version() {
            return Err(StoreError::SchemaTooNew {
                on_disk: schema.version,
                known: registry.version(),
            });
        }

        // Checkpointed tables, at the on-disk schema.
        let snapshot = SnapshotFile::new(config.path.join(SNAPSHOT_FILE));
        let mut tables = BTreeMap::new();
        let mut orphans = Vec::new();
        for saved in snapshot.read()? {
            match schema.table(&saved.name) {
                Some(declared) => {
                    let table = Table::from_snapshot(declared.clone(), saved);
                    tables.insert(table.name().to_string(), table);
                }
                None => orphans.push(saved),
            }
        }
        for (name, declared) in &schema.tables {
            tables
                .entry(name.clone())
                .or_insert_with(|| Table::new(declared.clone()));
        }

        // Every open ends in a checkpoint, so the journal always holds
        // changes made at the on-disk schema version.
        let (journal, entries) = Journal::open(config.path.join(JOURNAL_FILE), config.sync_interval)?;
        let replayed = entries.len();
        for entry in entries {
            Self::replay(&mut tables, entry);
        }

        for migration in registry.pending(schema.version) {
            for step in &migration.steps {
                Self::migrate(&mut schema, &mut tables, &mut orphans, step)?;
            }
            schema.version = migration.version;
            tracing::info!(version = migration.version, "applied schema migration");
        }
        if &schema != registry.schema() {
            tracing::warn!(
                version = schema.version,
                "on-disk schema differs from the declared schema at the same version"
            );
            Self::reconcile(registry.schema(), &mut tables, &mut orphans);
            schema = registry.schema().clone();
        }
        for orphan in &orphans {
            tracing::warn!(
                table = %orphan.name,
                records = orphan.records.len(),
                "checkpoint holds a table the schema does not declare; keeping it untouched"
            );
        }

        let store = Self {
            changes: ChangeLog::new(config.change_log_capacity),
            config,
            _lock_file: lock_file,
            schema,
            tables: tables
                .into_iter()
                .map(|(name, table)| (name, RwLock::new(table)))
                .collect(),
            orphans,
            journal,
            snapshot,
            subscriptions: SubscriptionManager::new(),
            seed,
            checkpoint_lock: Mutex::new(()),
        };
        store.verify()?;

        if fresh && store.config.seed {
            store.seed.apply(&store)?;
        }
        store.checkpoint()?;

        tracing::info!(
            path = %store.config.path.display(),
            version = store.schema.version,
            tables = store.tables.len(),
            replayed,
            fresh,
            "opened store"
        );
        Ok(store)
    }

    /// Apply one migration step to the loaded tables.
    ///
    /// Tolerates steps that already took effect, so an interrupted open can
    /// be repeated.
    fn migrate(
        schema: &mut Schema,
        tables: &mut BTreeMap<String, Table>,
        orphans: &mut Vec<TableSnapshot>,
        step: &MigrationStep,
    ) -> Result<()> {
        match step {
            MigrationStep::CreateTable(declared) => {
                let table = match orphans.iter().position(|o| o.name == declared.name) {
                    Some(i) => Table::from_snapshot(declared.clone(), orphans.remove(i)),
                    None => match tables.remove(&declared.name) {
                        Some(mut existing) => {
                            existing.set_schema(declared.clone());
                            existing
                        }
                        None => Table::new(declared.clone()),
                    },
                };
                schema.tables.insert(declared.name.clone(), declared.clone());
                tables.insert(declared.name.clone(), table);
            }
            MigrationStep::AddField { table, field } => {
                let declared = schema
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| StoreError::InvalidSchema(format!("unknown table '{table}'")))?;
                declared.fields.retain(|f| f.name != field.name);
                declared.fields.push(field.clone());
                if let Some(loaded) = tables.get_mut(table) {
                    loaded.add_field(field);
                }
            }
            MigrationStep::CreateIndex { table, field } | MigrationStep::DropIndex { table, field } => {
                let indexed = matches!(step, MigrationStep::CreateIndex { .. });
                let declared = schema
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| StoreError::InvalidSchema(format!("unknown table '{table}'")))?;
                let def = declared
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == field)
                    .ok_or_else(|| {
                        StoreError::InvalidSchema(format!("unknown field '{table}.{field}'"))
                    })?;
                def.indexed = indexed;
                if let Some(loaded) = tables.get_mut(table) {
                    loaded.set_schema(declared.clone());
                }
            }
        }
        Ok(())
    }

    /// Bring loaded tables in line with the declared schema. Tables the
    /// schema no longer declares become orphans instead of being dropped.
    fn reconcile(declared: &Schema, tables: &mut BTreeMap<String, Table>, orphans: &mut Vec<TableSnapshot>) {
        for (name, table_schema) in &declared.tables {
            match tables.get_mut(name) {
                Some(table) => {
                    for field in &table_schema.fields {
                        if table.schema().field(&field.name).is_none() {
                            table.add_field(field);
                        }
                    }
                    table.set_schema(table_schema.clone());
                }
                None => {
                    let table = match orphans.iter().position(|o| &o.name == name) {
                        Some(i) => Table::from_snapshot(table_schema.clone(), orphans.remove(i)),
                        None => Table::new(table_schema.clone()),
                    };
                    tables.insert(name.clone(), table);
                }
            }
        }

        let undeclared: Vec<String> = tables
            .keys()
            .filter(|name| declared.table(name).is_none())
            .cloned()
            .collect();
        for name in undeclared {
            if let Some(table) = tables.remove(&name) {
                orphans.push(table.snapshot());
            }
        }
    }

    fn replay(tables: &mut BTreeMap<String, Table>, entry: JournalEntry) {
        let Some(table) = tables.get_mut(&entry.table) else {
            tracing::warn!(seq = entry.seq, table = %entry.table, "journal entry for undeclared table skipped");
            return;
        };
        match entry.op {
            JournalOp::Add(record) => table.commit_add(record),
            JournalOp::BulkAdd(records) => {
                for record in records {
                    table.commit_add(record);
                }
            }
            JournalOp::Update { id, patch } => {
                if !table.commit_update(id, &patch) {
                    tracing::debug!(seq = entry.seq, table = %entry.table, %id, "replayed update of missing record");
                }
            }
            JournalOp::Delete { id } => {
                table.commit_delete(id);
            }
            JournalOp::Clear => table.clear(),
        }
    }

    fn table_lock(&self, table: &str) -> Result<&RwLock<Table>> {
        self.tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    // --- Record Operations ---

    /// Validate and insert a record, returning its new id.
    pub fn add(&self, table: &str, fields: Fields) -> Result<RecordId> {
        let (id, event) = {
            let mut guard = self.table_lock(table)?.write();
            let record = guard.prepare_add(fields)?;
            let id = record.id;
            self.journal.append(table, JournalOp::Add(record.clone()))?;
            guard.commit_add(record);
            (id, self.changes.record(table, ChangeKind::Added, Some(id)))
        };
        self.after_commit(vec![event]);
        Ok(id)
    }

    /// Insert a batch atomically. One invalid record rejects the whole batch.
    pub fn bulk_add(&self, table: &str, batch: Vec<Fields>) -> Result<Vec<RecordId>> {
        let mut guard = self.table_lock(table)?.write();
        let (ids, events) = self.bulk_add_locked(table, &mut guard, batch)?;
        drop(guard);
        self.after_commit(events);
        Ok(ids)
    }

    /// Insert a batch only if the table is empty, checked under the same lock.
    /// Returns how many records were inserted.
    pub(crate) fn bulk_add_if_empty(&self, table: &str, batch: Vec<Fields>) -> Result<usize> {
        let mut guard = self.table_lock(table)?.write();
        if !guard.is_empty() {
            return Ok(0);
        }
        let (ids, events) = self.bulk_add_locked(table, &mut guard, batch)?;
        drop(guard);
        self.after_commit(events);
        Ok(ids.len())
    }

    fn bulk_add_locked(
        &self,
        table: &str,
        guard: &mut Table,
        batch: Vec<Fields>,
    ) -> Result<(Vec<RecordId>, Vec<ChangeEvent>)> {
        if batch.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let records = guard.prepare_bulk_add(batch)?;
        self.journal.append(table, JournalOp::BulkAdd(records.clone()))?;

        let mut ids = Vec::with_capacity(records.len());
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            ids.push(record.id);
            events.push(self.changes.record(table, ChangeKind::Added, Some(record.id)));
            guard.commit_add(record);
        }
        Ok((ids, events))
    }

    /// Get a copy of a record.
    pub fn get(&self, table: &str, id: RecordId) -> Result<Record> {
        self.table_lock(table)?
            .read()
            .get(id)
            .ok_or_else(|| StoreError::not_found(table, id))
    }

    pub fn contains(&self, table: &str, id: RecordId) -> Result<bool> {
        Ok(self.table_lock(table)?.read().contains(id))
    }

    /// Patch the given fields of a record; other fields keep their values.
    pub fn update(&self, table: &str, id: RecordId, patch: Fields) -> Result<()> {
        let event = {
            let mut guard = self.table_lock(table)?.write();
            let patch = guard.prepare_update(id, patch)?;
            if patch.is_empty() {
                return Ok(());
            }
            self.journal.append(
                table,
                JournalOp::Update {
                    id,
                    patch: patch.clone(),
                },
            )?;
            guard.commit_update(id, &patch);
            self.changes.record(table, ChangeKind::Updated, Some(id))
        };
        self.after_commit(vec![event]);
        Ok(())
    }

    /// Remove a record. Records referring to it are left as they are.
    pub fn delete(&self, table: &str, id: RecordId) -> Result<()> {
        let event = {
            let mut guard = self.table_lock(table)?.write();
            guard.prepare_delete(id)?;
            self.journal.append(table, JournalOp::Delete { id })?;
            guard.commit_delete(id);
            self.changes.record(table, ChangeKind::Deleted, Some(id))
        };
        self.after_commit(vec![event]);
        Ok(())
    }

    /// Every record of a table, id ascending.
    pub fn scan_all(&self, table: &str) -> Result<Vec<Record>> {
        Ok(self.table_lock(table)?.read().scan_all())
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        Ok(self.table_lock(table)?.read().len())
    }

    /// Typed access to an application table.
    pub fn table<E: Entity>(&self) -> TableHandle<'_, E> {
        TableHandle::new(self)
    }

    fn after_commit(&self, events: Vec<ChangeEvent>) {
        self.subscriptions.publish(events, self);

        if self.config.checkpoint_every > 0 && self.journal.len() >= self.config.checkpoint_every {
            // The mutation is durable in the journal; a failed checkpoint
            // only delays truncation.
            if let Err(e) = self.checkpoint() {
                tracing::error!(error = %e, "automatic checkpoint failed");
            }
        }
    }

    // --- Queries ---

    /// Run a one-shot query.
    pub fn query(&self, query: &Query) -> Result<Vec<Record>> {
        query.validate(&self.schema)?;
        self.run_query(query)
    }

    /// First record of a query's result.
    pub fn first(&self, query: Query) -> Result<Option<Record>> {
        Ok(self.query(&query.limit(1))?.into_iter().next())
    }

    /// Access path the query would use.
    pub fn explain(&self, query: &Query) -> Result<AccessPath> {
        query.validate(&self.schema)?;
        Ok(query::plan(query, &self.table_lock(&query.table)?.read()))
    }

    // --- Live Queries ---

    /// Register a live query. `callback` receives the first result before
    /// this returns, then every changed result.
    pub fn subscribe<F>(&self, query: Query, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(query, callback, self)
    }

    /// Register a live query delivering over a channel.
    pub fn subscribe_channel(&self, query: Query) -> Result<LiveQueryReceiver> {
        self.subscriptions.subscribe_channel(query, self)
    }

    /// Cancel a live query. Returns false if it was not active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    pub fn subscription_state(&self, id: SubscriptionId) -> Option<LiveQueryState> {
        self.subscriptions.state(id)
    }

    /// Last result delivered to an active live query.
    pub fn live_result(&self, id: SubscriptionId) -> Option<Vec<Record>> {
        self.subscriptions.last_result(id)
    }

    // --- Lifecycle ---

    /// Empty every table, then re-apply the seed policy.
    ///
    /// Id counters restart at 1. Live queries over every table re-deliver.
    pub fn reset_all(&self) -> Result<()> {
        let events = {
            let mut guards: Vec<_> = self
                .tables
                .iter()
                .map(|(name, table)| (name, table.write()))
                .collect();
            let clears = guards
                .iter()
                .map(|(name, _)| (name.to_string(), JournalOp::Clear))
                .collect();
            self.journal.append_batch(clears)?;

            guards
                .iter_mut()
                .map(|(name, guard)| {
                    guard.clear();
                    self.changes.record(name.as_str(), ChangeKind::Reset, None)
                })
                .collect::<Vec<_>>()
        };
        tracing::info!(tables = events.len(), "reset all tables");

        // The clears are durable once journaled.
        self.subscriptions.publish(events, self);
        self.checkpoint()?;

        if self.config.seed {
            self.seed.apply(self)?;
        }
        Ok(())
    }

    /// Write a checkpoint and truncate the journal.
    pub fn sync(&self) -> Result<()> {
        self.checkpoint()
    }

    /// Checkpoint, cancel live queries and release the store lock.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        self.subscriptions.clear();
        tracing::info!(path = %self.config.path.display(), "closed store");
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        let _serial = self.checkpoint_lock.lock();

        let guards: Vec<_> = self.tables.values().map(|t| t.read()).collect();
        let mut snapshots: Vec<TableSnapshot> = guards.iter().map(|t| t.snapshot()).collect();
        snapshots.extend(self.orphans.iter().cloned());

        self.snapshot.write(&snapshots)?;
        Self::write_schema_marker(&self.config.path, &self.schema)?;
        self.journal.truncate()?;

        tracing::info!(
            tables = snapshots.len(),
            records = guards.iter().map(|t| t.len()).sum::<usize>(),
            "checkpoint written"
        );
        Ok(())
    }

    // --- Introspection ---

    /// Recent committed changes, oldest first.
    pub fn recent_changes(&self) -> Vec<ChangeEvent> {
        self.changes.recent()
    }

    /// Check every index against its table.
    pub fn verify(&self) -> Result<()> {
        for table in self.tables.values() {
            table.read().verify()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            table_count: self.tables.len(),
            subscription_count: self.subscriptions.subscription_count(),
            journal_entries: self.journal.len(),
            schema_version: self.schema.version,
            ..Default::default()
        };
        for table in self.tables.values() {
            let table = table.read();
            stats.record_count += table.len() as u64;
            stats.index_count += table.indices().len();
        }
        Ok(stats)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Files ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    fn read_schema_marker(path: &Path) -> Result<Option<Schema>> {
        let marker_path = path.join(SCHEMA_FILE);
        if !marker_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(marker_path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corruption(format!("unreadable schema marker: {e}")))
    }

    fn write_schema_marker(path: &Path, schema: &Schema) -> Result<()> {
        let tmp_path = path.join(format!("{SCHEMA_FILE}.tmp"));
        fs::write(&tmp_path, serde_json::to_vec_pretty(schema)?)?;
        File::open(&tmp_path)?.sync_all()?;
        fs::rename(tmp_path, path.join(SCHEMA_FILE))?;
        Ok(())
    }
}

impl QuerySource for Store {
    fn validate_query(&self, query: &Query) -> Result<()> {
        query.validate(&self.schema)
    }

    fn run_query(&self, query: &Query) -> Result<Vec<Record>> {
        let table = self
            .tables
            .get(&query.table)
            .ok_or_else(|| StoreError::QueryDefinition(format!("unknown table '{}'", query.table)))?;
        query::execute(query, &table.read())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort checkpoint on drop
        if !self.journal.is_empty() {
            let _ = self.checkpoint();
        }
    }
}
