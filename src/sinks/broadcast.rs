//! WebSocket broadcast sink. Best-effort by design: delivery counts are
//! logged, never enforced.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{ResultSink, SinkError};
use crate::hub::{Hub, ServerMessage};
use crate::record::ResultRecord;

pub struct BroadcastSink {
    hub: Arc<Hub>,
}

impl BroadcastSink {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ResultSink for BroadcastSink {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn apply(&self, result: &ResultRecord) -> Result<(), SinkError> {
        let frame = ServerMessage::ComputationResult {
            request_id: result.request_id.clone(),
            correlation_id: result.correlation_id.clone(),
            status: result.status,
            result: result.payload_json(),
        };

        let delivered = self.hub.broadcast(&frame);
        debug!(
            request_id = %result.request_id,
            delivered,
            "Result broadcast"
        );
        Ok(())
    }
}
