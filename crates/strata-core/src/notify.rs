//! Operator channel for failures that need a human.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Something an operator must look at.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorEvent {
    /// A run failed and its retry budget is spent.
    RunFailed {
        asset: String,
        partition: String,
        attempts: u32,
        error: String,
    },
    /// Downstream runs could not be enqueued after bounded retries.
    TriggerFailed {
        asset: String,
        partition: String,
        error: String,
    },
    /// A partition left the retention window without being committed.
    PartitionLost { partition: String, status: String },
    /// The sink rejected our credentials; the pass was aborted.
    AuthFailure { domain: String, error: String },
    /// A manifest key exhausted its attempts and is quarantined.
    ManifestKeyFailed {
        partition: String,
        attempts: u32,
        error: String,
    },
}

impl OperatorEvent {
    pub fn subject(&self) -> String {
        match self {
            OperatorEvent::RunFailed { asset, partition, .. } => {
                format!("run failed: {asset} [{partition}]")
            }
            OperatorEvent::TriggerFailed { asset, partition, .. } => {
                format!("trigger failed: {asset} [{partition}]")
            }
            OperatorEvent::PartitionLost { partition, .. } => format!("partition lost: {partition}"),
            OperatorEvent::AuthFailure { domain, .. } => format!("sink auth failure: {domain}"),
            OperatorEvent::ManifestKeyFailed { partition, .. } => {
                format!("partition quarantined: {partition}")
            }
        }
    }
}

/// Delivers operator events. Delivery problems are logged, never returned:
/// a broken alert channel must not fail ingestion.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, event: &OperatorEvent);
}

/// Logs every event at `error!`.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify(&self, event: &OperatorEvent) {
        let body = serde_json::to_string(event).unwrap_or_default();
        error!(event = "operator.alert", subject = %event.subject(), body = %body);
    }
}

/// POSTs events as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    local_mode: bool,
}

impl WebhookNotifier {
    /// `local_mode` logs instead of sending.
    pub fn new(url: impl Into<String>, local_mode: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            local_mode,
        }
    }

    /// Local mode when `STRATA_ENV=local`.
    pub fn from_env(url: impl Into<String>) -> Self {
        let local = std::env::var("STRATA_ENV").map(|v| v == "local").unwrap_or(false);
        Self::new(url, local)
    }
}

#[async_trait]
impl OperatorNotifier for WebhookNotifier {
    async fn notify(&self, event: &OperatorEvent) {
        if self.local_mode {
            info!(event = "operator.alert", subject = %event.subject(), "local mode, webhook not sent");
            return;
        }
        match self.client.post(&self.url).json(event).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(url = %self.url, status = resp.status().as_u16(), subject = %event.subject(), "webhook rejected alert"),
            Err(e) => warn!(url = %self.url, error = %e, subject = %event.subject(), "webhook delivery failed"),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<OperatorEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<OperatorEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl OperatorNotifier for MemoryNotifier {
    async fn notify(&self, event: &OperatorEvent) {
        self.events.lock().await.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = OperatorEvent::PartitionLost {
            partition: "screen_time/2024-01-01".into(),
            status: "pending".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["kind"], "partition_lost");
        assert!(event.subject().contains("2024-01-01"));
    }

    #[tokio::test]
    async fn local_mode_never_sends() {
        // Unroutable URL: a real send would log a failure, local mode skips it.
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/alerts", true);
        notifier
            .notify(&OperatorEvent::AuthFailure {
                domain: "screen_time".into(),
                error: "401".into(),
            })
            .await;
    }
}
