//! Schema registry client.
//!
//! Request record values are framed the Confluent way: one magic byte (0)
//! indicating the serialization format version, then a big-endian 32-bit
//! schema id, then the encoded document. The producer fetches the latest
//! registered id for the request subject at connect time and stamps it on
//! every value it publishes.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Magic byte that opens every registry-framed value.
const WIRE_FORMAT_MAGIC: u8 = 0;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("schema registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("schema registry returned status {status} for subject '{subject}'")]
    Subject {
        subject: String,
        status: reqwest::StatusCode,
    },
}

#[derive(Debug, Deserialize)]
struct SubjectVersion {
    id: i32,
}

/// Thin client for the registry's REST surface. Cheap to clone; the inner
/// reqwest client pools connections.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl SchemaRegistry {
    pub fn new(config: &crate::config::RegistryConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch the id of the latest schema registered under `subject`.
    pub async fn latest_schema_id(&self, subject: &str) -> Result<i32, RegistryError> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);

        let mut request = self.client.get(&url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Subject {
                subject: subject.to_string(),
                status: response.status(),
            });
        }

        let version: SubjectVersion = response.json().await?;
        debug!(subject = %subject, schema_id = version.id, "Resolved latest schema");
        Ok(version.id)
    }
}

/// Frame `document` with the wire-format prefix for `schema_id`.
pub fn encode_framed(schema_id: i32, document: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + document.len());
    out.push(WIRE_FORMAT_MAGIC);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(document);
    out
}

/// Strip the wire-format prefix, returning the schema id and the inner
/// document. Values without the magic byte pass through unframed, since
/// the backend is free to publish plain JSON on the result topic.
pub fn decode_framed(value: &[u8]) -> (Option<i32>, &[u8]) {
    if value.len() >= 5 && value[0] == WIRE_FORMAT_MAGIC {
        let id = i32::from_be_bytes([value[1], value[2], value[3], value[4]]);
        (Some(id), &value[5..])
    } else {
        (None, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_round_trip() {
        let framed = encode_framed(42, b"{\"ok\":true}");
        assert_eq!(framed[0], 0);
        assert_eq!(&framed[1..5], &42i32.to_be_bytes());

        let (id, inner) = decode_framed(&framed);
        assert_eq!(id, Some(42));
        assert_eq!(inner, b"{\"ok\":true}");
    }

    #[test]
    fn unframed_values_pass_through() {
        let raw = b"{\"requestId\":\"r-1\"}";
        let (id, inner) = decode_framed(raw);
        assert_eq!(id, None);
        assert_eq!(inner, raw.as_slice());
    }

    #[test]
    fn short_values_are_not_framed() {
        let (id, inner) = decode_framed(&[0, 1]);
        assert_eq!(id, None);
        assert_eq!(inner, &[0, 1]);
    }
}
