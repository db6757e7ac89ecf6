//! Change events produced by committed mutations.

use crate::types::RecordId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What a committed mutation did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
    /// Every record of the table was removed by a reset.
    Reset,
}

/// One committed mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic within a store instance.
    pub seq: u64,
    pub table: String,
    pub kind: ChangeKind,
    /// `None` for table-wide changes.
    pub affected: Option<RecordId>,
}

struct ChangeLogInner {
    next_seq: u64,
    recent: VecDeque<ChangeEvent>,
}

/// Assigns change sequence numbers and keeps the most recent events.
pub struct ChangeLog {
    inner: Mutex<ChangeLogInner>,
    capacity: usize,
}

impl ChangeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ChangeLogInner {
                next_seq: 1,
                recent: VecDeque::with_capacity(capacity.min(1024)),
            }),
            capacity,
        }
    }

    /// Record a committed change and return the event.
    pub fn record(&self, table: &str, kind: ChangeKind, affected: Option<RecordId>) -> ChangeEvent {
        let mut inner = self.inner.lock();
        let event = ChangeEvent {
            seq: inner.next_seq,
            table: table.to_string(),
            kind,
            affected,
        };
        inner.next_seq += 1;

        if self.capacity > 0 {
            if inner.recent.len() == self.capacity {
                inner.recent.pop_front();
            }
            inner.recent.push_back(event.clone());
        }

        tracing::debug!(seq = event.seq, table, ?kind, ?affected, "change committed");
        event
    }

    /// Retained events, oldest first.
    pub fn recent(&self) -> Vec<ChangeEvent> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    /// Sequence number the next event will get.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }
}
