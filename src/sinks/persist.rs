//! Ledger persistence sink. Runs first: the ledger is the recovery
//! surface, so the row must be in place (or its failure reported) before
//! waiters resolve or clients hear about the result.

use async_trait::async_trait;
use tracing::debug;

use super::{ResultSink, SinkError};
use crate::ledger::ResultLedger;
use crate::record::ResultRecord;

pub struct PersistSink {
    ledger: ResultLedger,
}

impl PersistSink {
    pub fn new(ledger: ResultLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ResultSink for PersistSink {
    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn apply(&self, result: &ResultRecord) -> Result<(), SinkError> {
        self.ledger.upsert_result(result).await?;
        debug!(
            request_id = %result.request_id,
            status = %result.status,
            "Result persisted"
        );
        Ok(())
    }
}
