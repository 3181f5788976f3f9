//! Result log consumer.
//!
//! Subscribes to the result topic as part of the shared gateway consumer
//! group and drives the router for every record. Offsets are committed
//! manually after routing, so each offset is handed to the router at most
//! once per group while the ledger upsert keeps redelivery harmless.
//!
//! Malformed records are quarantined: logged, counted, and their offset
//! committed so they never wedge the partition. Historical results are
//! recovered from the ledger, not by replay, which is why subscription
//! starts at `latest`.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::record::ResultRecord;
use crate::registry;
use crate::router::{ResultRouter, RouteOutcome};
use crate::shutdown::ShutdownSignal;
use crate::{RESULT_CONSUMER_GROUP, RESULT_TOPIC};

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer could not start: {0}")]
    Kafka(#[from] KafkaError),
}

/// Record decode failures. Never propagated past the consumer loop.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record has no value")]
    Empty,

    #[error("record value is not a result document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle of the consumer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Running,
}

/// Long-lived consumer for the result topic.
pub struct ResultConsumer {
    kafka: KafkaConfig,
    router: Arc<ResultRouter>,
    state: Arc<Mutex<ConsumerState>>,
}

impl ResultConsumer {
    pub fn new(kafka: KafkaConfig, router: Arc<ResultRouter>) -> Self {
        Self {
            kafka,
            router,
            state: Arc::new(Mutex::new(ConsumerState::Disconnected)),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().expect("consumer state poisoned")
    }

    fn set_state(state: &Mutex<ConsumerState>, next: ConsumerState) {
        *state.lock().expect("consumer state poisoned") = next;
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        self.kafka.apply(&mut config);
        config.set("group.id", RESULT_CONSUMER_GROUP);
        config.set("session.timeout.ms", SESSION_TIMEOUT.as_millis().to_string());
        config.set(
            "heartbeat.interval.ms",
            HEARTBEAT_INTERVAL.as_millis().to_string(),
        );
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "latest");
        config.set("client.id", client_id());
        config
    }

    /// Connect, subscribe, and spawn the processing loop. Once this
    /// returns, every well-formed record on the result topic reaches the
    /// router until shutdown.
    pub fn start(&self, shutdown: &ShutdownSignal) -> Result<JoinHandle<()>, ConsumerError> {
        Self::set_state(&self.state, ConsumerState::Connecting);
        let consumer: StreamConsumer = self.client_config().create()?;
        consumer.subscribe(&[RESULT_TOPIC])?;
        Self::set_state(&self.state, ConsumerState::Subscribed);

        info!(
            topic = RESULT_TOPIC,
            group = RESULT_CONSUMER_GROUP,
            "Result consumer subscribed"
        );

        let router = Arc::clone(&self.router);
        let state = Arc::clone(&self.state);
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            Self::set_state(&state, ConsumerState::Running);
            let mut processed: u64 = 0;
            let mut quarantined: u64 = 0;

            loop {
                // The in-flight record below is always routed and
                // committed before the next shutdown check, so stopping
                // never abandons a half-processed offset.
                let message = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(processed, quarantined, "Result consumer stopping");
                        break;
                    }
                    message = consumer.recv() => message,
                };

                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "Result topic read error");
                        continue;
                    }
                };

                match decode_result(message.payload()) {
                    Ok(result) => {
                        let outcome = router.route(&result).await;
                        match outcome {
                            RouteOutcome::Ok => processed += 1,
                            outcome => {
                                warn!(
                                    request_id = %result.request_id,
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    outcome = ?outcome,
                                    "Result routed with failures"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        quarantined += 1;
                        warn!(
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            outcome = ?RouteOutcome::Decode,
                            "Quarantined malformed result record"
                        );
                    }
                }

                // Commit either way: poison messages must not wedge the
                // partition, and routed ones are already durable.
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    error!(
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %e,
                        "Offset commit failed"
                    );
                }

                if processed > 0 && processed.is_multiple_of(100) {
                    info!(processed, quarantined, "Consumer statistics");
                }
            }

            Self::set_state(&state, ConsumerState::Disconnected);
        });

        Ok(handle)
    }
}

/// Stable-ish client id for broker-side logs.
fn client_id() -> String {
    match hostname::get() {
        Ok(name) => format!("gateway-{}", name.to_string_lossy()),
        Err(_) => format!("gateway-{}", Uuid::new_v4()),
    }
}

/// Decode one record value into a [`ResultRecord`], stripping the
/// registry wire framing when present.
fn decode_result(payload: Option<&[u8]>) -> Result<ResultRecord, DecodeError> {
    let bytes = payload.ok_or(DecodeError::Empty)?;
    let (schema_id, document) = registry::decode_framed(bytes);
    debug!(schema_id = ?schema_id, len = document.len(), "Decoding result record");
    Ok(serde_json::from_slice(document)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResultStatus;

    const VALID: &str = r#"{
        "requestId": "r-1",
        "correlationId": "c-1",
        "status": "SUCCESS",
        "payload": "{\"bac\":0.04}",
        "computedAt": "2026-08-02T12:00:00Z",
        "processingTimeMs": 12
    }"#;

    #[test]
    fn decodes_plain_json_values() {
        let result = decode_result(Some(VALID.as_bytes())).unwrap();
        assert_eq!(result.request_id, "r-1");
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.processing_time_ms, Some(12));
    }

    #[test]
    fn decodes_registry_framed_values() {
        let framed = registry::encode_framed(9, VALID.as_bytes());
        let result = decode_result(Some(&framed)).unwrap();
        assert_eq!(result.correlation_id, "c-1");
    }

    #[test]
    fn malformed_bytes_are_a_decode_error() {
        assert!(matches!(
            decode_result(Some(b"not json at all")),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(decode_result(None), Err(DecodeError::Empty)));
    }

    #[test]
    fn starts_disconnected() {
        let kafka = KafkaConfig {
            brokers: vec!["localhost:9092".into()],
            ssl: false,
            sasl: None,
        };
        let router = Arc::new(ResultRouter::with_sinks(Vec::new()));
        let consumer = ResultConsumer::new(kafka, router);
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }

    #[test]
    fn client_config_pins_group_semantics() {
        let kafka = KafkaConfig {
            brokers: vec!["localhost:9092".into()],
            ssl: false,
            sasl: None,
        };
        let router = Arc::new(ResultRouter::with_sinks(Vec::new()));
        let consumer = ResultConsumer::new(kafka, router);
        let config = consumer.client_config();

        assert_eq!(config.get("group.id"), Some(RESULT_CONSUMER_GROUP));
        assert_eq!(config.get("session.timeout.ms"), Some("30000"));
        assert_eq!(config.get("heartbeat.interval.ms"), Some("3000"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }
}
