//! Request log producer.
//!
//! Publishes [`RequestRecord`]s to the request topic with idempotent
//! producer semantics. The connection is established lazily on the first
//! publish, at which point the latest schema id for the request subject is
//! fetched and cached for value framing.
//!
//! Publish failures surface to the caller as [`PublishError`]; there are no
//! application-layer retries beyond what librdkafka provides under
//! idempotent mode, with one exception: a rejected record triggers a single
//! schema-id refresh and re-send, covering a registry evolution between
//! connect and publish.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::record::RequestRecord;
use crate::registry::{self, RegistryError, SchemaRegistry};
use crate::{PRODUCER_TRANSACTIONAL_ID, REQUEST_TOPIC, SOURCE_HEADER_VALUE};

/// Upper bound on unacknowledged in-flight publishes per session. Keeping
/// this at five preserves ordering under the idempotent producer.
const MAX_IN_FLIGHT: u32 = 5;

/// How long a single publish may sit in the send queue before failing.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced to submission callers. Retryable with the same
/// `requestId`; the backend dedups on it.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker publish failed: {0}")]
    Kafka(#[from] KafkaError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("request record could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Broker-assigned placement of a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub partition: i32,
    pub offset: i64,
}

/// The publish seam the dispatcher depends on.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, record: &RequestRecord) -> Result<PublishAck, PublishError>;
}

struct Session {
    producer: FutureProducer,
    schema_id: i32,
}

/// Idempotent producer for the request topic.
pub struct RequestProducer {
    kafka: KafkaConfig,
    registry: SchemaRegistry,
    session: Mutex<Option<Session>>,
}

impl RequestProducer {
    pub fn new(kafka: KafkaConfig, registry: SchemaRegistry) -> Self {
        Self {
            kafka,
            registry,
            session: Mutex::new(None),
        }
    }

    /// The registry subject whose latest schema frames request values.
    pub fn value_subject() -> String {
        format!("{REQUEST_TOPIC}-value")
    }

    /// Whether the lazy connection has been established.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        self.kafka.apply(&mut config);
        config.set("enable.idempotence", "true");
        config.set(
            "max.in.flight.requests.per.connection",
            MAX_IN_FLIGHT.to_string(),
        );
        config.set("transactional.id", PRODUCER_TRANSACTIONAL_ID);
        config.set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string());
        config
    }

    /// Connect on first use and hand back a session clone. The lock is not
    /// held across the actual send.
    async fn session(&self) -> Result<(FutureProducer, i32), PublishError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok((session.producer.clone(), session.schema_id));
        }

        let producer: FutureProducer = self.client_config().create()?;
        let schema_id = self.registry.latest_schema_id(&Self::value_subject()).await?;

        info!(
            brokers = %self.kafka.bootstrap_servers(),
            schema_id,
            "Request producer connected"
        );

        *slot = Some(Session {
            producer: producer.clone(),
            schema_id,
        });
        Ok((producer, schema_id))
    }

    /// Re-resolve the schema id on the live session, returning the fresh id.
    async fn refresh_schema(&self) -> Result<i32, PublishError> {
        let schema_id = self.registry.latest_schema_id(&Self::value_subject()).await?;
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_mut() {
            session.schema_id = schema_id;
        }
        Ok(schema_id)
    }

    async fn send_once(
        &self,
        producer: &FutureProducer,
        record: &RequestRecord,
        value: &[u8],
    ) -> Result<PublishAck, KafkaError> {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "correlation-id",
                value: Some(record.correlation_id.as_str()),
            })
            .insert(Header {
                key: "source",
                value: Some(SOURCE_HEADER_VALUE),
            });

        let future_record = FutureRecord::to(REQUEST_TOPIC)
            .key(record.request_id.as_str())
            .payload(value)
            .headers(headers);

        match producer.send(future_record, PUBLISH_TIMEOUT).await {
            Ok((partition, offset)) => Ok(PublishAck { partition, offset }),
            Err((e, _)) => Err(e),
        }
    }
}

#[async_trait]
impl Publish for RequestProducer {
    async fn publish(&self, record: &RequestRecord) -> Result<PublishAck, PublishError> {
        let (producer, schema_id) = self.session().await?;
        let value = frame_value(record, schema_id)?;

        match self.send_once(&producer, record, &value).await {
            Ok(ack) => {
                debug!(
                    request_id = %record.request_id,
                    partition = ack.partition,
                    offset = ack.offset,
                    "Request published"
                );
                Ok(ack)
            }
            Err(e) if is_schema_rejection(&e) => {
                warn!(
                    request_id = %record.request_id,
                    error = %e,
                    "Record rejected, refreshing schema id and retrying once"
                );
                let schema_id = self.refresh_schema().await?;
                let value = frame_value(record, schema_id)?;
                let ack = self.send_once(&producer, record, &value).await?;
                Ok(ack)
            }
            Err(e) => Err(PublishError::Kafka(e)),
        }
    }
}

/// A broker rejection that suggests the cached schema id went stale.
fn is_schema_rejection(e: &KafkaError) -> bool {
    matches!(
        e,
        KafkaError::MessageProduction(RDKafkaErrorCode::InvalidRecord)
            | KafkaError::MessageProduction(RDKafkaErrorCode::InvalidMessage)
    )
}

/// Serialize a record and frame it with the registry wire format.
fn frame_value(record: &RequestRecord, schema_id: i32) -> Result<Vec<u8>, serde_json::Error> {
    let document = serde_json::to_vec(record)?;
    Ok(registry::encode_framed(schema_id, &document))
}
