//! # Velivolant Gateway
//!
//! Dispatch fabric between HTTP/WebSocket clients and the native compute
//! backend: requests go out over a partitioned Kafka log, results come back
//! on a second log and are fanned out to the ledger, to in-process waiters,
//! and to subscribed WebSocket clients.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP API -> Dispatcher -> Producer -> request topic
//!                                                      |
//!                                                  (backend)
//!                                                      |
//! Consumer <- result topic <---------------------------+
//!     |
//!     v
//! Router -> { Ledger upsert, Waiter resolve, WS broadcast }
//! ```
//!
//! ## Modules
//!
//! - [`record`]: Request/result wire types shared across producer and consumer
//! - [`dispatcher`]: Submission entry point, waiter table, deadlines
//! - [`router`]: Result routing over the three sink subscribers
//! - [`sinks`]: Sink trait and the persist/waiter/broadcast implementations
//! - [`ledger`]: Durable result store, the recovery surface for polling
//! - [`hub`]: WebSocket fan-out with per-user and per-event indices

pub mod auth;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod http;
pub mod hub;
pub mod ledger;
pub mod producer;
pub mod record;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod sinks;

// Re-export commonly used types at crate root
pub use dispatcher::Dispatcher;
pub use record::{RequestRecord, RequestType, ResultRecord, ResultStatus};
pub use router::ResultRouter;
pub use sinks::{ResultSink, SinkError};

/// Kafka topic the gateway publishes compute requests to.
pub const REQUEST_TOPIC: &str = "velivolant.event-requests.v1";

/// Kafka topic the backend publishes computation results to.
pub const RESULT_TOPIC: &str = "velivolant.computation-results.v1";

/// Consumer group for the result topic. Stable across gateway instances so
/// each offset is delivered to at most one member.
pub const RESULT_CONSUMER_GROUP: &str = "velivolant-middle-results";

/// Transactional id pinned on the idempotent producer session.
pub const PRODUCER_TRANSACTIONAL_ID: &str = "velivolant-producer";

/// Value the `source` header carries on every published request.
pub const SOURCE_HEADER_VALUE: &str = "gateway";
