//! Result router.
//!
//! Drives every decoded result through the sink subscribers in a fixed
//! order: persist, resolve waiter, broadcast. The persist step happens
//! before the other two so the ledger row exists by the time anything
//! user-visible fires; a failing step is logged and the remaining steps
//! still run, so a ledger outage never penalizes a blocked caller and a
//! dead hub never blocks persistence.
//!
//! Each routed record collapses to a single [`RouteOutcome`] tag that the
//! consumer loop treats as a state machine input: every outcome commits
//! the offset, only the tags differ in what they log.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::hub::Hub;
use crate::ledger::ResultLedger;
use crate::record::ResultRecord;
use crate::sinks::{BroadcastSink, PersistSink, ResultSink, WaiterSink};

/// What happened to one record on the result topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// All sinks applied.
    Ok,
    /// The record never reached the sinks; its bytes were malformed.
    Decode,
    /// The ledger upsert failed. Waiter and broadcast still ran.
    Persist,
    /// The waiter step failed.
    ResolveFailed,
    /// The broadcast step failed.
    BroadcastFailed,
}

impl RouteOutcome {
    fn for_sink(name: &str) -> Self {
        match name {
            "ledger" => RouteOutcome::Persist,
            "waiter" => RouteOutcome::ResolveFailed,
            _ => RouteOutcome::BroadcastFailed,
        }
    }
}

/// Fans each result out to its subscribers.
pub struct ResultRouter {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl ResultRouter {
    /// Standard wiring: ledger first, then waiters, then the hub.
    pub fn new(ledger: ResultLedger, dispatcher: Arc<Dispatcher>, hub: Arc<Hub>) -> Self {
        Self::with_sinks(vec![
            Arc::new(PersistSink::new(ledger)),
            Arc::new(WaiterSink::new(dispatcher)),
            Arc::new(BroadcastSink::new(hub)),
        ])
    }

    /// Custom sink set, in application order.
    pub fn with_sinks(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self { sinks }
    }

    /// Apply every sink to `result`, in order, regardless of individual
    /// failures. Returns the first failure's tag, or [`RouteOutcome::Ok`].
    pub async fn route(&self, result: &ResultRecord) -> RouteOutcome {
        let mut outcome = RouteOutcome::Ok;

        for sink in &self.sinks {
            match sink.apply(result).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        sink = sink.name(),
                        request_id = %result.request_id,
                        correlation_id = %result.correlation_id,
                        error = %e,
                        "Result sink failed"
                    );
                    if outcome == RouteOutcome::Ok {
                        outcome = RouteOutcome::for_sink(sink.name());
                    }
                }
            }
        }

        debug!(
            request_id = %result.request_id,
            status = %result.status,
            outcome = ?outcome,
            sinks = self.sinks.len(),
            "Result routed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResultStatus;
    use crate::sinks::SinkError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct RecordingSink {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, _result: &ResultRecord) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(self.name);
            if self.fail {
                Err(SinkError::Failed(format!("{} unavailable", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn result() -> ResultRecord {
        ResultRecord {
            request_id: "r-1".into(),
            correlation_id: "c-1".into(),
            status: ResultStatus::Success,
            payload: Some("{}".into()),
            computed_at: Utc::now(),
            processing_time_ms: Some(1),
            error_message: None,
        }
    }

    fn router_with(
        plan: &[(&'static str, bool)],
    ) -> (ResultRouter, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sinks = plan
            .iter()
            .map(|&(name, fail)| {
                Arc::new(RecordingSink {
                    name,
                    fail,
                    calls: calls.clone(),
                }) as Arc<dyn ResultSink>
            })
            .collect();
        (ResultRouter::with_sinks(sinks), calls)
    }

    #[tokio::test]
    async fn sinks_run_in_registration_order() {
        let (router, calls) = router_with(&[
            ("ledger", false),
            ("waiter", false),
            ("broadcast", false),
        ]);

        let outcome = router.route(&result()).await;
        assert_eq!(outcome, RouteOutcome::Ok);
        assert_eq!(*calls.lock().unwrap(), vec!["ledger", "waiter", "broadcast"]);
    }

    #[tokio::test]
    async fn persist_failure_does_not_stop_later_sinks() {
        let (router, calls) = router_with(&[
            ("ledger", true),
            ("waiter", false),
            ("broadcast", false),
        ]);

        let outcome = router.route(&result()).await;
        assert_eq!(outcome, RouteOutcome::Persist);
        assert_eq!(*calls.lock().unwrap(), vec!["ledger", "waiter", "broadcast"]);
    }

    #[tokio::test]
    async fn first_failure_wins_the_outcome_tag() {
        let (router, _) = router_with(&[
            ("ledger", false),
            ("waiter", true),
            ("broadcast", true),
        ]);

        assert_eq!(router.route(&result()).await, RouteOutcome::ResolveFailed);
    }

    #[tokio::test]
    async fn broadcast_failure_is_tagged_as_such() {
        let (router, _) = router_with(&[
            ("ledger", false),
            ("waiter", false),
            ("broadcast", true),
        ]);

        assert_eq!(router.route(&result()).await, RouteOutcome::BroadcastFailed);
    }
}
