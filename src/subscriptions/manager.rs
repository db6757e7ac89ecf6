//! Live query registry and change dispatch.

use crate::changes::ChangeEvent;
use crate::error::Result;
use crate::query::Query;
use crate::types::Record;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{
    DeliverFn, DropReason, LiveQueryEvent, LiveQueryReceiver, LiveQueryState, SubscriptionId,
};

/// Where live queries get their results from.
pub trait QuerySource {
    /// Reject a definition that names unknown tables or fields.
    fn validate_query(&self, query: &Query) -> Result<()>;

    /// Evaluate a query against the current committed state.
    fn run_query(&self, query: &Query) -> Result<Vec<Record>>;
}

enum Sink {
    Callback(DeliverFn),
    Channel(Sender<LiveQueryEvent>),
}

struct Materialization {
    state: LiveQueryState,
    last: Option<Vec<Record>>,
}

/// Internal live query state.
struct LiveQuery {
    id: SubscriptionId,
    query: Query,
    sink: Sink,
    /// Set by unsubscribe; shared with the channel receiver.
    cancelled: Arc<AtomicBool>,
    inner: Mutex<Materialization>,
}

impl LiveQuery {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.inner.lock().state == LiveQueryState::Cancelled
    }

    fn set_state(&self, state: LiveQueryState) {
        let mut inner = self.inner.lock();
        if inner.state != LiveQueryState::Cancelled {
            inner.state = state;
        }
    }

    /// Cache `result`; true if it differs from the previous one.
    fn materialize(&self, result: &[Record]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == LiveQueryState::Cancelled {
            return false;
        }
        inner.state = LiveQueryState::Materialized;
        if inner.last.as_deref() == Some(result) {
            return false;
        }
        inner.last = Some(result.to_vec());
        true
    }

    /// Hand a result to the subscriber. Returns false if the receiver is gone.
    fn deliver(&self, result: &[Record]) -> bool {
        match &self.sink {
            Sink::Callback(callback) => {
                callback(result);
                true
            }
            Sink::Channel(sender) => sender.send(LiveQueryEvent::Result(result.to_vec())).is_ok(),
        }
    }
}

/// Clears the dispatch flag when the outermost dispatch loop exits.
struct DispatchFlag<'a>(&'a Cell<bool>);

impl Drop for DispatchFlag<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Tracks live queries and re-evaluates them when their table changes.
///
/// No registry lock is held while a result is delivered, so a callback may
/// subscribe, unsubscribe or mutate the store. Mutations made from inside a
/// callback are queued and dispatched by the loop that is already running
/// on that thread.
pub struct SubscriptionManager {
    /// Active live queries by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<LiveQuery>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Changes not yet dispatched.
    pending: Mutex<VecDeque<ChangeEvent>>,
    /// Serializes dispatch; the flag marks a dispatch loop running on the
    /// owning thread.
    dispatch: ReentrantMutex<Cell<bool>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            dispatch: ReentrantMutex::new(Cell::new(false)),
        }
    }

    /// Register a callback live query.
    ///
    /// The first result is computed and delivered before this returns.
    pub fn subscribe<F>(&self, query: Query, callback: F, source: &dyn QuerySource) -> Result<SubscriptionId>
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.register(query, Sink::Callback(Arc::new(callback)), cancelled, source)
    }

    /// Register a live query delivering over a channel.
    pub fn subscribe_channel(&self, query: Query, source: &dyn QuerySource) -> Result<LiveQueryReceiver> {
        let (sender, receiver) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = self.register(query, Sink::Channel(sender), cancelled.clone(), source)?;
        Ok(LiveQueryReceiver::new(id, receiver, cancelled))
    }

    fn register(
        &self,
        query: Query,
        sink: Sink,
        cancelled: Arc<AtomicBool>,
        source: &dyn QuerySource,
    ) -> Result<SubscriptionId> {
        source.validate_query(&query)?;

        let _gate = self.dispatch.lock();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let live = Arc::new(LiveQuery {
            id,
            query,
            sink,
            cancelled,
            inner: Mutex::new(Materialization {
                state: LiveQueryState::Registered,
                last: None,
            }),
        });
        self.subscriptions.write().insert(id, live.clone());

        let result = match source.run_query(&live.query) {
            Ok(result) => result,
            Err(e) => {
                self.subscriptions.write().remove(&id);
                return Err(e);
            }
        };

        live.materialize(&result);
        tracing::debug!(subscription = id.0, table = %live.query.table, rows = result.len(), "live query registered");
        if !live.deliver(&result) {
            self.drop_subscription(&live, DropReason::Disconnected);
        }
        Ok(id)
    }

    /// Cancel a live query. Safe to call from inside its own callback.
    ///
    /// Waits for a delivery running on another thread to finish, so the
    /// handler is never invoked once this returns. Returns false if the ID
    /// was not active.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _gate = self.dispatch.lock();
        let Some(live) = self.subscriptions.write().remove(&id) else {
            return false;
        };
        live.cancelled.store(true, Ordering::Release);
        live.inner.lock().state = LiveQueryState::Cancelled;
        tracing::debug!(subscription = id.0, "live query cancelled");
        true
    }

    /// Dispatch committed changes to the live queries that read the touched
    /// tables. Returns once every affected query has been recomputed and,
    /// where its result changed, delivered.
    pub fn publish(&self, events: Vec<ChangeEvent>, source: &dyn QuerySource) {
        if events.is_empty() {
            return;
        }
        self.pending.lock().extend(events);

        let gate = self.dispatch.lock();
        if gate.replace(true) {
            // Re-entered from a callback; the running loop picks this up.
            return;
        }
        let _flag = DispatchFlag(&*gate);

        loop {
            let batch: Vec<ChangeEvent> = self.pending.lock().drain(..).collect();
            if batch.is_empty() {
                break;
            }

            let touched: BTreeSet<&str> = batch.iter().map(|e| e.table.as_str()).collect();
            let mut affected: Vec<Arc<LiveQuery>> = self
                .subscriptions
                .read()
                .values()
                .filter(|live| touched.contains(live.query.table.as_str()))
                .cloned()
                .collect();
            affected.sort_by_key(|live| live.id);

            for live in &affected {
                live.set_state(LiveQueryState::Stale);
            }
            for live in affected {
                self.refresh(&live, source);
            }
        }
    }

    fn refresh(&self, live: &LiveQuery, source: &dyn QuerySource) {
        if live.is_cancelled() {
            return;
        }

        match source.run_query(&live.query) {
            Ok(result) => {
                if live.materialize(&result) && !live.is_cancelled() {
                    tracing::debug!(
                        subscription = live.id.0,
                        table = %live.query.table,
                        rows = result.len(),
                        "live query delivered"
                    );
                    if !live.deliver(&result) {
                        self.drop_subscription(live, DropReason::Disconnected);
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    subscription = live.id.0,
                    table = %live.query.table,
                    error = %e,
                    "live query recomputation failed, dropping subscription"
                );
                self.drop_subscription(live, DropReason::Error(e.to_string()));
            }
        }
    }

    fn drop_subscription(&self, live: &LiveQuery, reason: DropReason) {
        self.subscriptions.write().remove(&live.id);
        live.inner.lock().state = LiveQueryState::Cancelled;
        if let Sink::Channel(sender) = &live.sink {
            // Best effort; the receiver may be gone already.
            let _ = sender.send(LiveQueryEvent::Dropped { reason });
        }
    }

    /// Current state, or `None` once the query is no longer registered.
    pub fn state(&self, id: SubscriptionId) -> Option<LiveQueryState> {
        let live = self.subscriptions.read().get(&id).cloned()?;
        let state = live.inner.lock().state;
        Some(state)
    }

    /// Last materialized result of an active live query.
    pub fn last_result(&self, id: SubscriptionId) -> Option<Vec<Record>> {
        let live = self.subscriptions.read().get(&id).cloned()?;
        let last = live.inner.lock().last.clone();
        last
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Cancel every live query.
    pub fn clear(&self) {
        let _gate = self.dispatch.lock();
        let drained: Vec<Arc<LiveQuery>> = self.subscriptions.write().drain().map(|(_, l)| l).collect();
        for live in drained {
            live.cancelled.store(true, Ordering::Release);
            live.inner.lock().state = LiveQueryState::Cancelled;
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{ChangeKind, ChangeLog};
    use crate::error::StoreError;
    use crate::fields;
    use crate::query::execute;
    use crate::schema::{FieldDef, Schema, TableSchema};
    use crate::storage::Table;
    use crate::types::{Fields, RecordId, Value};
    use std::sync::atomic::AtomicUsize;

    /// One in-memory table acting as the query source.
    struct Source {
        schema: Schema,
        table: Mutex<Table>,
        fail: AtomicBool,
        changes: ChangeLog,
    }

    impl Source {
        fn new() -> Self {
            let tasks = TableSchema::new(
                "tasks",
                vec![
                    FieldDef::text("text"),
                    FieldDef::int("priority").default_value(2i64).indexed(),
                ],
            );
            let mut schema = Schema::default();
            schema.tables.insert("tasks".into(), tasks.clone());
            Self {
                schema,
                table: Mutex::new(Table::new(tasks)),
                fail: AtomicBool::new(false),
                changes: ChangeLog::new(16),
            }
        }

        fn add(&self, fields: Fields) -> ChangeEvent {
            let mut table = self.table.lock();
            let record = table.prepare_add(fields).unwrap();
            let id = record.id;
            table.commit_add(record);
            self.changes.record("tasks", ChangeKind::Added, Some(id))
        }

        fn set_priority(&self, id: u64, priority: i64) -> ChangeEvent {
            let mut table = self.table.lock();
            let patch = table
                .prepare_update(RecordId(id), fields! { "priority" => priority })
                .unwrap();
            table.commit_update(RecordId(id), &patch);
            self.changes.record("tasks", ChangeKind::Updated, Some(RecordId(id)))
        }
    }

    impl QuerySource for Source {
        fn validate_query(&self, query: &Query) -> Result<()> {
            query.validate(&self.schema)
        }

        fn run_query(&self, query: &Query) -> Result<Vec<Record>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Corruption("index out of sync".into()));
            }
            execute(query, &self.table.lock())
        }
    }

    fn urgent() -> Query {
        Query::table("tasks").where_eq("priority", 1i64)
    }

    #[test]
    fn test_first_result_delivered_on_subscribe() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        source.add(fields! { "text" => "Stock check", "priority" => 1i64 });

        let rx = manager.subscribe_channel(urgent(), &source).unwrap();
        match rx.try_recv().unwrap() {
            LiveQueryEvent::Result(records) => assert_eq!(records.len(), 1),
            other => panic!("Expected Result event, got {:?}", other),
        }
        assert_eq!(manager.state(rx.id), Some(LiveQueryState::Materialized));
    }

    #[test]
    fn test_invalid_query_never_registers() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let err = manager
            .subscribe(Query::table("tasks").where_eq("owner", 1i64), |_| {}, &source)
            .unwrap_err();
        assert!(matches!(err, StoreError::QueryDefinition(_)));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_only_changed_results_are_delivered() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let deliveries = Arc::new(AtomicUsize::new(0));
        let counter = deliveries.clone();
        manager
            .subscribe(urgent(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }, &source)
            .unwrap();
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);

        // Not urgent: result unchanged.
        let event = source.add(fields! { "text" => "Order cups", "priority" => 3i64 });
        manager.publish(vec![event], &source);
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);

        let event = source.set_priority(1, 1);
        manager.publish(vec![event], &source);
        assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_events_for_other_tables_are_ignored() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let rx = manager.subscribe_channel(urgent(), &source).unwrap();
        rx.latest();

        let other = source.changes.record("inventory", ChangeKind::Added, Some(RecordId(1)));
        manager.publish(vec![other], &source);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_batch_is_coalesced() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let rx = manager.subscribe_channel(Query::table("tasks"), &source).unwrap();
        rx.latest();

        let events = vec![
            source.add(fields! { "text" => "A" }),
            source.add(fields! { "text" => "B" }),
        ];
        manager.publish(events, &source);

        assert_eq!(rx.try_recv().unwrap(), LiveQueryEvent::Result(source.table.lock().scan_all()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_delivery_after_unsubscribe() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let rx = manager.subscribe_channel(Query::table("tasks"), &source).unwrap();

        let event = source.add(fields! { "text" => "A" });
        manager.publish(vec![event], &source);
        assert!(manager.unsubscribe(rx.id));
        assert!(!manager.unsubscribe(rx.id));

        // Results queued before cancellation are suppressed too.
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.state(rx.id), None);
    }

    #[test]
    fn test_unsubscribe_inside_callback() {
        let manager = Arc::new(SubscriptionManager::new());
        let source = Source::new();
        let deliveries = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(std::sync::OnceLock::new());

        let (m, count, cell) = (manager.clone(), deliveries.clone(), own_id.clone());
        let id = manager
            .subscribe(Query::table("tasks"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = cell.get() {
                    m.unsubscribe(*id);
                }
            }, &source)
            .unwrap();
        own_id.set(id).unwrap();

        let event = source.add(fields! { "text" => "A" });
        manager.publish(vec![event], &source);
        let event = source.add(fields! { "text" => "B" });
        manager.publish(vec![event], &source);

        assert_eq!(deliveries.load(Ordering::SeqCst), 2);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_failed_recompute_drops_subscription() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let rx = manager.subscribe_channel(Query::table("tasks"), &source).unwrap();
        rx.latest();

        source.fail.store(true, Ordering::SeqCst);
        let event = source.add(fields! { "text" => "A" });
        manager.publish(vec![event], &source);

        assert!(matches!(
            rx.try_recv().unwrap(),
            LiveQueryEvent::Dropped {
                reason: DropReason::Error(_)
            }
        ));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_disconnected_receiver_is_dropped() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let rx = manager.subscribe_channel(Query::table("tasks"), &source).unwrap();
        drop(rx);

        let event = source.add(fields! { "text" => "A" });
        manager.publish(vec![event], &source);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_last_result_tracks_materialization() {
        let manager = SubscriptionManager::new();
        let source = Source::new();
        let id = manager.subscribe(urgent(), |_| {}, &source).unwrap();
        assert_eq!(manager.last_result(id), Some(vec![]));

        let event = source.add(fields! { "text" => "A", "priority" => 1i64 });
        manager.publish(vec![event], &source);
        let last = manager.last_result(id).unwrap();
        assert_eq!(last[0].get("priority"), &Value::Int(1));
    }
}
