//! Wire types for the request and result topics.
//!
//! A [`RequestRecord`] is what the gateway publishes toward the compute
//! backend; a [`ResultRecord`] is what comes back on the result topic. Both
//! sides echo `requestId` (per-submission identity, idempotency key) and
//! `correlationId` (the routing key for waiters and WebSocket broadcasts).
//!
//! # Example
//!
//! ```json
//! {
//!   "requestId": "8f14e45f-...",
//!   "correlationId": "6512bd43-...",
//!   "requestType": "BAC_CALCULATION",
//!   "payload": { "userId": 1, "eventId": 10, "libations": [] },
//!   "submittedAt": "2026-08-02T12:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of computation the backend knows how to run.
///
/// Unknown values are rejected when the record is deserialized, so an
/// invalid `type` never makes it past the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "BAC_CALCULATION")]
    BacCalculation,
    #[serde(rename = "EVENT_ANALYTICS")]
    EventAnalytics,
    #[serde(rename = "USER_SCORE")]
    UserScore,
    #[serde(rename = "LEADERBOARD")]
    Leaderboard,
}

impl RequestType {
    /// The wire name of this request type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::BacCalculation => "BAC_CALCULATION",
            RequestType::EventAnalytics => "EVENT_ANALYTICS",
            RequestType::UserScore => "USER_SCORE",
            RequestType::Leaderboard => "LEADERBOARD",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT")]
    Timeout,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Error => "ERROR",
            ResultStatus::Timeout => "TIMEOUT",
        }
    }

    /// Parse a ledger column value back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(ResultStatus::Success),
            "ERROR" => Some(ResultStatus::Error),
            "TIMEOUT" => Some(ResultStatus::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute request published to the request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Globally unique per submission; dedup key at the backend.
    pub request_id: String,

    /// Groups this request with its eventual reply. Callers may reuse one to
    /// route a specific result to their waiter.
    pub correlation_id: String,

    /// Computation kind, used by the backend to pick a handler.
    pub request_type: RequestType,

    /// Opaque to the gateway; the backend's schema owns its shape.
    pub payload: Value,

    /// Routing hint for WebSocket fan-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,

    /// Routing hint for WebSocket fan-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,

    /// Wall clock at publish time.
    pub submitted_at: DateTime<Utc>,
}

/// A computation result consumed from the result topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    /// Echoed from the request; identity of what this result answers.
    pub request_id: String,

    /// Echoed from the request; routing key for waiters and broadcasts.
    pub correlation_id: String,

    pub status: ResultStatus,

    /// Serialized result, present iff `status` is `SUCCESS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    pub computed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,

    /// Populated iff `status` is not `SUCCESS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ResultRecord {
    /// Parse the serialized payload into JSON where possible, falling back
    /// to the raw string. Used when shaping client-facing frames.
    pub fn payload_json(&self) -> Option<Value> {
        self.payload.as_ref().map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_record_round_trip() {
        let json_str = r#"{
            "requestId": "r-1",
            "correlationId": "c-1",
            "requestType": "BAC_CALCULATION",
            "payload": {"userId": 1, "eventId": 10, "libations": []},
            "submittedAt": "2026-08-02T12:00:00Z"
        }"#;

        let record: RequestRecord = serde_json::from_str(json_str).unwrap();
        assert_eq!(record.request_id, "r-1");
        assert_eq!(record.request_type, RequestType::BacCalculation);
        assert_eq!(record.payload["eventId"], 10);

        let out = serde_json::to_string(&record).unwrap();
        assert!(out.contains("requestId")); // camelCase on the wire
        assert!(out.contains("BAC_CALCULATION"));
        assert!(!out.contains("userId\":null"));
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let err = serde_json::from_str::<RequestType>("\"MINING\"");
        assert!(err.is_err());
    }

    #[test]
    fn result_record_defaults_optional_fields() {
        let json_str = r#"{
            "requestId": "r-1",
            "correlationId": "c-1",
            "status": "ERROR",
            "computedAt": "2026-08-02T12:00:01Z",
            "errorMessage": "divide by zero"
        }"#;

        let record: ResultRecord = serde_json::from_str(json_str).unwrap();
        assert_eq!(record.status, ResultStatus::Error);
        assert!(record.payload.is_none());
        assert!(record.processing_time_ms.is_none());
        assert_eq!(record.error_message.as_deref(), Some("divide by zero"));
    }

    #[test]
    fn payload_json_parses_embedded_document() {
        let record = ResultRecord {
            request_id: "r-1".into(),
            correlation_id: "c-1".into(),
            status: ResultStatus::Success,
            payload: Some("{\"bac\":0.04}".into()),
            computed_at: Utc::now(),
            processing_time_ms: Some(12),
            error_message: None,
        };

        assert_eq!(record.payload_json(), Some(json!({"bac": 0.04})));
    }

    #[test]
    fn status_parse_round_trip() {
        for status in [ResultStatus::Success, ResultStatus::Error, ResultStatus::Timeout] {
            assert_eq!(ResultStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ResultStatus::parse("PENDING"), None);
    }
}
