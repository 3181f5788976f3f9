//! Result sinks.
//!
//! Every result pulled off the result topic is fed to three subscribers in
//! a fixed order: the ledger upsert, the waiter resolution, and the
//! WebSocket broadcast. The [`ResultSink`] trait is the seam between the
//! router and those subscribers, which keeps ledger durability decoupled
//! from broadcast liveness and lets tests drive the router with stubs.
//!
//! ## Built-in sinks
//!
//! - [`PersistSink`]: durable upsert into the result ledger
//! - [`WaiterSink`]: resolve the in-process waiter for the correlation id
//! - [`BroadcastSink`]: fan the result out to WebSocket clients

pub mod broadcast;
pub mod persist;
pub mod waiter;

use async_trait::async_trait;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::record::ResultRecord;

pub use broadcast::BroadcastSink;
pub use persist::PersistSink;
pub use waiter::WaiterSink;

/// Errors raised by a sink. The router reports them independently; one
/// failing sink never aborts the others.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Persistence(#[from] LedgerError),

    #[error("sink failed: {0}")]
    Failed(String),
}

/// A subscriber to routed results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stable name, used in the audit log and for outcome tagging.
    fn name(&self) -> &'static str;

    async fn apply(&self, result: &ResultRecord) -> Result<(), SinkError>;
}
