//! Live queries.
//!
//! A live query is a [`Query`](crate::query::Query) that stays registered
//! after its first evaluation. Every committed change to the table it reads
//! re-runs it from scratch, and the new result is delivered only when it
//! differs from the previous one.
//!
//! Results are delivered either to a callback or over a channel:
//!
//! ```ignore
//! let rx = store.subscribe_channel(Query::table("tasks").where_eq("completed", false))?;
//!
//! loop {
//!     match rx.recv() {
//!         Ok(LiveQueryEvent::Result(tasks)) => render(&tasks),
//!         Ok(LiveQueryEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::{QuerySource, SubscriptionManager};
pub use types::{
    DeliverFn, DropReason, LiveQueryEvent, LiveQueryReceiver, LiveQueryState, SubscriptionId,
};
