//! Ingestion sinks: the authenticated, idempotent-per-partition write boundary.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use strata_state::PartitionKey;
use tracing::debug;

use crate::landing::{DeviceInfo, FsLandingStore, IngestPayload};

/// Sink failure, already classified for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Rejected(String),
}

/// Confirmation that a whole partition was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkReceipt {
    pub accepted: usize,
}

/// Write boundary for one partition's records.
///
/// Implementations must be idempotent per partition key: submitting an
/// accepted partition again replaces it and never duplicates it. A returned
/// receipt means the whole batch was accepted.
#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn submit(&self, key: &PartitionKey, records: &[Value]) -> Result<SinkReceipt, SinkError>;
}

/// POSTs [`IngestPayload`] documents to an HTTP ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpIngestionSink {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    device: DeviceInfo,
}

impl HttpIngestionSink {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        device: DeviceInfo,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| SinkError::Transient(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
            device,
        })
    }
}

/// Map a non-success HTTP status to the failure class.
pub fn classify_status(status: u16, body: &str) -> SinkError {
    let msg = format!("sink returned {status}: {body}");
    match status {
        401 | 403 => SinkError::Auth(msg),
        408 | 429 | 500..=599 => SinkError::Transient(msg),
        _ => SinkError::Rejected(msg),
    }
}

#[async_trait]
impl IngestionSink for HttpIngestionSink {
    async fn submit(&self, key: &PartitionKey, records: &[Value]) -> Result<SinkReceipt, SinkError> {
        let payload = IngestPayload::new(key, &self.device, records.to_vec());
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SinkError::Transient(format!("sink request timed out: {e}"))
                } else {
                    SinkError::Transient(format!("sink request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(partition = %key, status = status.as_u16(), records = records.len(), "partition accepted");
            return Ok(SinkReceipt {
                accepted: records.len(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }
}

/// Writes payloads straight into a landing directory.
///
/// Each partition lands as `<domain>.json` inside its partition directory,
/// so a replay overwrites instead of duplicating.
#[derive(Debug, Clone)]
pub struct LandingDirSink {
    landing: FsLandingStore,
    device: DeviceInfo,
}

impl LandingDirSink {
    pub fn new(landing: FsLandingStore, device: DeviceInfo) -> Self {
        Self { landing, device }
    }
}

#[async_trait]
impl IngestionSink for LandingDirSink {
    async fn submit(&self, key: &PartitionKey, records: &[Value]) -> Result<SinkReceipt, SinkError> {
        let payload = IngestPayload::new(key, &self.device, records.to_vec());
        let landing = self.landing.clone();
        let key = key.clone();
        let file_name = format!("{}.json", key.domain);
        tokio::task::spawn_blocking(move || landing.write(&key, &file_name, &payload))
            .await
            .map_err(|e| SinkError::Transient(format!("landing writer task failed: {e}")))?
            .map_err(|e| SinkError::Transient(format!("landing write failed: {e}")))?;
        Ok(SinkReceipt {
            accepted: records.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use strata_state::Domain;

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_id: "mac-1".into(),
            device_name: "Studio".into(),
            device_type: "macos".into(),
        }
    }

    #[test]
    fn status_classes() {
        assert!(matches!(classify_status(401, ""), SinkError::Auth(_)));
        assert!(matches!(classify_status(403, ""), SinkError::Auth(_)));
        assert!(matches!(classify_status(503, ""), SinkError::Transient(_)));
        assert!(matches!(classify_status(429, ""), SinkError::Transient(_)));
        assert!(matches!(classify_status(422, "bad"), SinkError::Rejected(_)));
    }

    #[tokio::test]
    async fn landing_sink_replay_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let landing = FsLandingStore::open(dir.path()).unwrap();
        let sink = LandingDirSink::new(landing.clone(), device());
        let key = PartitionKey::new(
            Domain::new("screen_time").unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 4).unwrap(),
        );

        sink.submit(&key, &[json!({"app": "mail"})]).await.unwrap();
        let receipt = sink
            .submit(&key, &[json!({"app": "mail"}), json!({"app": "maps"})])
            .await
            .unwrap();
        assert_eq!(receipt.accepted, 2);

        let docs = landing.read_partition(&key).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].value["data"].as_array().unwrap().len(), 2);
        assert!(docs[0].file.ends_with("screen_time.json"));
    }
}
