//! Submission entry point for compute requests.
//!
//! The [`Dispatcher`] assigns request/correlation ids, registers waiters,
//! enforces deadlines, and hands records to the producer. It owns two
//! in-memory tables:
//!
//! - the **waiter table**: one-shot completion channels keyed by
//!   correlation id, resolved by the result router or expired by a single
//!   periodic sweep (no per-waiter timers);
//! - the **pending table**: `{submittedAt, type, correlationId}` per
//!   in-flight request id, kept for observability (`/api/compute/stats`)
//!   and trimmed on a timer independent of waiter expiry.
//!
//! The waiter is always registered *before* the record is published, so a
//! result that races the publish ack still finds its waiter. On publish
//! failure the waiter is removed and the submission fails; nothing is
//! silently dropped.
//!
//! A deadline on [`Dispatcher::submit_and_wait`] is local: the backend's
//! work is not cancelled, and its eventual result still lands in the ledger
//! where it can be recovered by request id.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::producer::{Publish, PublishError};
use crate::record::{RequestRecord, RequestType, ResultRecord, ResultStatus};
use crate::shutdown::ShutdownSignal;

/// Default deadline for request/reply submissions.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Waiters are dropped this long after registration whether or not they
/// resolved. Leak ceiling for callers that never observe a result.
pub const WAITER_TTL: Duration = Duration::from_secs(300);

/// Pending entries older than this are trimmed by the cleanup timer.
const PENDING_MAX_AGE: Duration = Duration::from_secs(600);

const WAITER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const PENDING_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The producer could not enqueue the record. Retryable with the same
    /// request id.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Deadline exceeded while waiting for a result. The computation may
    /// still complete and is then recoverable from the ledger.
    #[error("no result within {timeout:?} for request {request_id}")]
    Timeout {
        request_id: String,
        timeout: Duration,
    },

    /// The backend answered with a non-success status.
    #[error("{message}")]
    Computation { message: String },

    /// A waiter is already registered for this correlation id.
    #[error("waiter already registered for correlation id {correlation_id}")]
    WaiterConflict { correlation_id: String },

    /// The waiter was expired out from under the caller.
    #[error("waiter expired before a result arrived")]
    WaiterDropped,
}

/// Caller-supplied knobs for a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Reuse a correlation id so a specific result routes back here.
    /// A fresh id is generated when absent.
    pub correlation_id: Option<String>,
    pub user_id: Option<i64>,
    pub event_id: Option<i64>,
}

/// Identity handed back for a fire-and-forget submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub request_id: String,
    pub correlation_id: String,
}

struct Waiter {
    tx: oneshot::Sender<ResultRecord>,
    registered_at: Instant,
}

/// Correlation-id keyed table of one-shot waiters.
///
/// Shared between the dispatcher (registration, deadline removal) and the
/// result router's waiter sink (completion). Mutations take the single
/// table mutex and never hold it across a suspension point.
#[derive(Default)]
pub struct WaiterTable {
    inner: Mutex<HashMap<String, Waiter>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. At most one may exist per correlation id;
    /// a second registration is a programming error, not a queue.
    pub fn register(
        &self,
        correlation_id: &str,
    ) -> Result<oneshot::Receiver<ResultRecord>, DispatchError> {
        let mut table = self.inner.lock().expect("waiter table poisoned");
        if table.contains_key(correlation_id) {
            return Err(DispatchError::WaiterConflict {
                correlation_id: correlation_id.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        table.insert(
            correlation_id.to_string(),
            Waiter {
                tx,
                registered_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Resolve and remove the waiter for `correlation_id`, if any.
    /// Returns whether a waiter was found.
    pub fn complete(&self, correlation_id: &str, record: ResultRecord) -> bool {
        let waiter = {
            let mut table = self.inner.lock().expect("waiter table poisoned");
            table.remove(correlation_id)
        };
        match waiter {
            // A dropped receiver just means the caller went away first.
            Some(waiter) => {
                let _ = waiter.tx.send(record);
                true
            }
            None => false,
        }
    }

    /// Remove without resolving (deadline expiry, publish failure).
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.inner
            .lock()
            .expect("waiter table poisoned")
            .remove(correlation_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("waiter table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every waiter older than `ttl`. Returns how many were dropped.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut table = self.inner.lock().expect("waiter table poisoned");
        let before = table.len();
        table.retain(|_, waiter| now.duration_since(waiter.registered_at) < ttl);
        before - table.len()
    }
}

struct PendingEntry {
    submitted_at: Instant,
    request_type: RequestType,
    correlation_id: String,
}

/// Entry point for synchronous and fire-and-forget compute submissions.
pub struct Dispatcher {
    publisher: Arc<dyn Publish>,
    waiters: Arc<WaiterTable>,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl Dispatcher {
    pub fn new(publisher: Arc<dyn Publish>) -> Self {
        Self {
            publisher,
            waiters: Arc::new(WaiterTable::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The waiter table, shared with the result router's waiter sink.
    pub fn waiters(&self) -> Arc<WaiterTable> {
        Arc::clone(&self.waiters)
    }

    /// Number of submissions awaiting a result, for health and stats.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }

    /// Fire-and-forget submission: publish and return the assigned ids.
    pub async fn submit(
        &self,
        request_type: RequestType,
        payload: Value,
        opts: SubmitOptions,
    ) -> Result<SubmitReceipt, DispatchError> {
        let record = self.build_record(request_type, payload, &opts);
        let receipt = SubmitReceipt {
            request_id: record.request_id.clone(),
            correlation_id: record.correlation_id.clone(),
        };

        self.publisher.publish(&record).await?;
        self.track_pending(&record);

        debug!(
            request_id = %receipt.request_id,
            correlation_id = %receipt.correlation_id,
            request_type = %request_type,
            "Request submitted"
        );
        Ok(receipt)
    }

    /// Submit with a registered waiter, handing back the completion
    /// channel. The waiter goes into the table before the publish, so a
    /// result beating the publish ack is still routed; it is taken back
    /// out if the publish fails.
    pub async fn submit_with_waiter(
        &self,
        request_type: RequestType,
        payload: Value,
        opts: SubmitOptions,
    ) -> Result<(SubmitReceipt, oneshot::Receiver<ResultRecord>), DispatchError> {
        let record = self.build_record(request_type, payload, &opts);
        let receipt = SubmitReceipt {
            request_id: record.request_id.clone(),
            correlation_id: record.correlation_id.clone(),
        };

        let rx = self.waiters.register(&record.correlation_id)?;

        if let Err(e) = self.publisher.publish(&record).await {
            self.waiters.remove(&record.correlation_id);
            warn!(
                request_id = %receipt.request_id,
                error = %e,
                "Publish failed, waiter removed"
            );
            return Err(e.into());
        }

        self.track_pending(&record);
        Ok((receipt, rx))
    }

    /// Request/reply submission: block until the result arrives or the
    /// deadline passes.
    pub async fn submit_and_wait(
        &self,
        request_type: RequestType,
        payload: Value,
        opts: SubmitOptions,
        timeout: Option<Duration>,
    ) -> Result<ResultRecord, DispatchError> {
        let timeout = timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let (receipt, rx) = self.submit_with_waiter(request_type, payload, opts).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(record)) => match record.status {
                ResultStatus::Success => Ok(record),
                _ => Err(DispatchError::Computation {
                    message: record
                        .error_message
                        .unwrap_or_else(|| "Computation failed".to_string()),
                }),
            },
            Ok(Err(_)) => Err(DispatchError::WaiterDropped),
            Err(_) => {
                self.waiters.remove(&receipt.correlation_id);
                info!(
                    request_id = %receipt.request_id,
                    timeout_secs = timeout.as_secs(),
                    "Deadline passed without a result; ledger remains the recovery surface"
                );
                Err(DispatchError::Timeout {
                    request_id: receipt.request_id,
                    timeout,
                })
            }
        }
    }

    /// Drop the pending entry once a result has been routed for
    /// `request_id`. Called by the waiter sink.
    pub fn mark_settled(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(request_id);
    }

    /// Single timer task covering waiter expiry and pending-table
    /// trimming. Runs until shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: &ShutdownSignal) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            let mut waiter_sweep = tokio::time::interval(WAITER_SWEEP_INTERVAL);
            let mut pending_cleanup = tokio::time::interval(PENDING_CLEANUP_INTERVAL);
            // The first tick of an interval fires immediately.
            waiter_sweep.tick().await;
            pending_cleanup.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Dispatcher maintenance stopping");
                        break;
                    }
                    _ = waiter_sweep.tick() => {
                        let dropped = dispatcher.waiters.sweep_expired(WAITER_TTL);
                        if dropped > 0 {
                            warn!(dropped, "Expired unresolved waiters");
                        }
                    }
                    _ = pending_cleanup.tick() => {
                        let trimmed = dispatcher.trim_pending(PENDING_MAX_AGE);
                        if trimmed > 0 {
                            debug!(trimmed, "Trimmed stale pending entries");
                        }
                    }
                }
            }
        })
    }

    fn trim_pending(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock().expect("pending table poisoned");
        let before = pending.len();
        pending.retain(|request_id, entry| {
            let keep = now.duration_since(entry.submitted_at) < max_age;
            if !keep {
                debug!(
                    request_id = %request_id,
                    correlation_id = %entry.correlation_id,
                    request_type = %entry.request_type,
                    "Pending entry never settled"
                );
            }
            keep
        });
        before - pending.len()
    }

    fn track_pending(&self, record: &RequestRecord) {
        self.pending.lock().expect("pending table poisoned").insert(
            record.request_id.clone(),
            PendingEntry {
                submitted_at: Instant::now(),
                request_type: record.request_type,
                correlation_id: record.correlation_id.clone(),
            },
        );
    }

    fn build_record(
        &self,
        request_type: RequestType,
        payload: Value,
        opts: &SubmitOptions,
    ) -> RequestRecord {
        RequestRecord {
            request_id: Uuid::new_v4().to_string(),
            correlation_id: opts
                .correlation_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            request_type,
            payload,
            user_id: opts.user_id,
            event_id: opts.event_id,
            submitted_at: Utc::now(),
        }
    }
}

// Convenience wrappers: fix the request type and shape the payload the way
// the backend expects it. All of them go through `submit_and_wait`.
impl Dispatcher {
    pub async fn calculate_bac(
        &self,
        user_id: i64,
        event_id: i64,
        libations: Value,
    ) -> Result<ResultRecord, DispatchError> {
        self.submit_and_wait(
            RequestType::BacCalculation,
            json!({ "userId": user_id, "eventId": event_id, "libations": libations }),
            SubmitOptions {
                user_id: Some(user_id),
                event_id: Some(event_id),
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn event_analytics(&self, event_id: i64) -> Result<ResultRecord, DispatchError> {
        self.submit_and_wait(
            RequestType::EventAnalytics,
            json!({ "eventId": event_id }),
            SubmitOptions {
                event_id: Some(event_id),
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn leaderboard(
        &self,
        event_id: i64,
        limit: u32,
        metric: &str,
    ) -> Result<ResultRecord, DispatchError> {
        self.submit_and_wait(
            RequestType::Leaderboard,
            json!({ "eventId": event_id, "limit": limit, "metric": metric }),
            SubmitOptions {
                event_id: Some(event_id),
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn user_score(
        &self,
        user_id: i64,
        event_id: i64,
    ) -> Result<ResultRecord, DispatchError> {
        self.submit_and_wait(
            RequestType::UserScore,
            json!({ "userId": user_id, "eventId": event_id }),
            SubmitOptions {
                user_id: Some(user_id),
                event_id: Some(event_id),
                ..Default::default()
            },
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{PublishAck, PublishError};
    use async_trait::async_trait;
    use rdkafka::error::KafkaError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Publisher stub. Optionally fails, optionally completes the waiter
    /// from inside `publish` to simulate a result racing the publish ack.
    struct StubPublisher {
        fail: AtomicBool,
        complete_during_publish: Mutex<Option<Arc<WaiterTable>>>,
        published: Mutex<Vec<RequestRecord>>,
    }

    impl StubPublisher {
        fn ok() -> Self {
            Self {
                fail: AtomicBool::new(false),
                complete_during_publish: Mutex::new(None),
                published: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            let stub = Self::ok();
            stub.fail.store(true, Ordering::SeqCst);
            stub
        }

        fn result_for(record: &RequestRecord, status: ResultStatus) -> ResultRecord {
            ResultRecord {
                request_id: record.request_id.clone(),
                correlation_id: record.correlation_id.clone(),
                status,
                payload: (status == ResultStatus::Success).then(|| "{\"ok\":true}".to_string()),
                computed_at: Utc::now(),
                processing_time_ms: Some(5),
                error_message: (status != ResultStatus::Success)
                    .then(|| "backend exploded".to_string()),
            }
        }
    }

    #[async_trait]
    impl Publish for StubPublisher {
        async fn publish(&self, record: &RequestRecord) -> Result<PublishAck, PublishError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PublishError::Kafka(KafkaError::Canceled));
            }
            self.published.lock().unwrap().push(record.clone());

            if let Some(waiters) = self.complete_during_publish.lock().unwrap().as_ref() {
                // The waiter must already be registered at this point.
                let completed = waiters.complete(
                    &record.correlation_id,
                    Self::result_for(record, ResultStatus::Success),
                );
                assert!(completed, "waiter not registered before publish");
            }
            Ok(PublishAck {
                partition: 0,
                offset: 1,
            })
        }
    }

    fn dispatcher_with(stub: StubPublisher) -> (Arc<Dispatcher>, Arc<StubPublisher>) {
        let stub = Arc::new(stub);
        let dispatcher = Arc::new(Dispatcher::new(stub.clone()));
        (dispatcher, stub)
    }

    #[tokio::test]
    async fn submit_assigns_fresh_ids_and_tracks_pending() {
        let (dispatcher, stub) = dispatcher_with(StubPublisher::ok());

        let first = dispatcher
            .submit(RequestType::UserScore, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let second = dispatcher
            .submit(RequestType::UserScore, json!({}), SubmitOptions::default())
            .await
            .unwrap();

        assert_ne!(first.request_id, second.request_id);
        assert_ne!(first.correlation_id, second.correlation_id);
        assert_eq!(dispatcher.pending_count(), 2);
        assert_eq!(stub.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn submit_honors_caller_correlation_id() {
        let (dispatcher, _) = dispatcher_with(StubPublisher::ok());

        let receipt = dispatcher
            .submit(
                RequestType::EventAnalytics,
                json!({}),
                SubmitOptions {
                    correlation_id: Some("fixed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(receipt.correlation_id, "fixed");
    }

    #[tokio::test]
    async fn publish_failure_fails_submission_and_leaves_no_state() {
        let (dispatcher, _) = dispatcher_with(StubPublisher::failing());

        let err = dispatcher
            .submit_and_wait(
                RequestType::BacCalculation,
                json!({}),
                SubmitOptions::default(),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Publish(_)));
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(dispatcher.waiters.is_empty());
    }

    #[tokio::test]
    async fn waiter_is_registered_before_publish() {
        let (dispatcher, stub) = dispatcher_with(StubPublisher::ok());
        *stub.complete_during_publish.lock().unwrap() = Some(dispatcher.waiters());

        // The stub resolves the waiter while the publish is still in
        // flight; the call must still observe the result.
        let result = dispatcher
            .submit_and_wait(
                RequestType::Leaderboard,
                json!({"eventId": 10}),
                SubmitOptions::default(),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert!(dispatcher.waiters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_with_timeout_and_removes_waiter() {
        let (dispatcher, _) = dispatcher_with(StubPublisher::ok());

        let err = dispatcher
            .submit_and_wait(
                RequestType::Leaderboard,
                json!({}),
                SubmitOptions::default(),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(dispatcher.waiters.is_empty());
    }

    #[tokio::test]
    async fn non_success_result_maps_to_computation_error() {
        let (dispatcher, _) = dispatcher_with(StubPublisher::ok());
        let waiters = dispatcher.waiters();

        let dispatcher_clone = Arc::clone(&dispatcher);
        let call = tokio::spawn(async move {
            dispatcher_clone
                .submit_and_wait(
                    RequestType::BacCalculation,
                    json!({}),
                    SubmitOptions {
                        correlation_id: Some("c-err".into()),
                        ..Default::default()
                    },
                    Some(Duration::from_secs(5)),
                )
                .await
        });

        // Wait for the waiter to appear, then reject it.
        while waiters.is_empty() {
            tokio::task::yield_now().await;
        }
        let record = ResultRecord {
            request_id: "r-x".into(),
            correlation_id: "c-err".into(),
            status: ResultStatus::Error,
            payload: None,
            computed_at: Utc::now(),
            processing_time_ms: None,
            error_message: Some("backend exploded".into()),
        };
        assert!(waiters.complete("c-err", record));

        let err = call.await.unwrap().unwrap_err();
        match err {
            DispatchError::Computation { message } => assert_eq!(message, "backend exploded"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn double_registration_is_a_conflict() {
        let table = WaiterTable::new();
        let _rx = table.register("dup").unwrap();
        let err = table.register("dup").unwrap_err();
        assert!(matches!(err, DispatchError::WaiterConflict { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_stale_waiters() {
        let table = WaiterTable::new();
        for i in 0..4 {
            let _rx = table.register(&format!("c-{i}")).unwrap();
        }
        assert_eq!(table.len(), 4);

        tokio::time::advance(WAITER_TTL + Duration::from_secs(1)).await;
        assert_eq!(table.sweep_expired(WAITER_TTL), 4);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn mark_settled_clears_pending_entry() {
        let (dispatcher, _) = dispatcher_with(StubPublisher::ok());

        let receipt = dispatcher
            .submit(RequestType::UserScore, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.mark_settled(&receipt.request_id);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trim_pending_drops_only_old_entries() {
        let (dispatcher, _) = dispatcher_with(StubPublisher::ok());

        dispatcher
            .submit(RequestType::UserScore, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        tokio::time::advance(PENDING_MAX_AGE + Duration::from_secs(1)).await;
        dispatcher
            .submit(RequestType::UserScore, json!({}), SubmitOptions::default())
            .await
            .unwrap();

        assert_eq!(dispatcher.trim_pending(PENDING_MAX_AGE), 1);
        assert_eq!(dispatcher.pending_count(), 1);
    }
}
