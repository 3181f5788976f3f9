//! Waiter resolution sink.
//!
//! Looks up the correlation id in the dispatcher's waiter table and hands
//! the record to the blocked caller. A missing waiter is the normal case,
//! not a failure: fire-and-forget submissions never register one, and a
//! timed-out caller has already removed its entry.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{ResultSink, SinkError};
use crate::dispatcher::Dispatcher;
use crate::record::ResultRecord;

pub struct WaiterSink {
    dispatcher: Arc<Dispatcher>,
}

impl WaiterSink {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl ResultSink for WaiterSink {
    fn name(&self) -> &'static str {
        "waiter"
    }

    async fn apply(&self, result: &ResultRecord) -> Result<(), SinkError> {
        let resolved = self
            .dispatcher
            .waiters()
            .complete(&result.correlation_id, result.clone());
        self.dispatcher.mark_settled(&result.request_id);

        debug!(
            correlation_id = %result.correlation_id,
            resolved,
            "Waiter lookup"
        );
        Ok(())
    }
}
