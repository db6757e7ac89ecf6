//! Live query types.

use crate::types::Record;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a live query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle of a live query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveQueryState {
    /// Stored, first result not computed yet.
    Registered,
    /// Last result cached and delivered.
    Materialized,
    /// A table it reads changed; recomputation owed.
    Stale,
    /// Terminal.
    Cancelled,
}

/// Why a live query stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The receiving side went away.
    Disconnected,
    /// Recomputation failed.
    Error(String),
}

/// Message delivered over a live query channel.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveQueryEvent {
    /// The full, current result of the query.
    Result(Vec<Record>),
    /// No further results will follow.
    Dropped { reason: DropReason },
}

/// Callback invoked with each new result.
pub type DeliverFn = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Receiving end of a channel-backed live query.
///
/// Once the query is unsubscribed the receiver yields nothing more, even for
/// results that were already queued.
pub struct LiveQueryReceiver {
    pub id: SubscriptionId,
    receiver: Receiver<LiveQueryEvent>,
    cancelled: Arc<AtomicBool>,
}

impl LiveQueryReceiver {
    pub(crate) fn new(
        id: SubscriptionId,
        receiver: Receiver<LiveQueryEvent>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            receiver,
            cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<LiveQueryEvent, RecvError> {
        if self.is_cancelled() {
            return Err(RecvError);
        }
        let event = self.receiver.recv()?;
        if self.is_cancelled() {
            return Err(RecvError);
        }
        Ok(event)
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<LiveQueryEvent, TryRecvError> {
        if self.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        let event = self.receiver.try_recv()?;
        if self.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        Ok(event)
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<LiveQueryEvent, RecvTimeoutError> {
        if self.is_cancelled() {
            return Err(RecvTimeoutError::Disconnected);
        }
        let event = self.receiver.recv_timeout(timeout)?;
        if self.is_cancelled() {
            return Err(RecvTimeoutError::Disconnected);
        }
        Ok(event)
    }

    /// Drain everything queued and return the newest result, if any.
    pub fn latest(&self) -> Option<Vec<Record>> {
        let mut latest = None;
        while let Ok(event) = self.try_recv() {
            if let LiveQueryEvent::Result(records) = event {
                latest = Some(records);
            }
        }
        latest
    }
}

impl fmt::Debug for LiveQueryReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryReceiver")
            .field("id", &self.id)
            .field("queued", &self.receiver.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
