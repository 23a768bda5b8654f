//! Record sources: anything that can yield candidate records for a partition.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use strata_state::PartitionKey;
use tracing::warn;

use crate::metrics::METRICS;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable for {partition}: {reason}")]
    Unavailable { partition: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Yields the candidate records of one partition.
///
/// A partition with no data yields an empty vector, not an error. Sources
/// skip individual unparseable records rather than failing the partition.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn extract(&self, key: &PartitionKey) -> Result<Vec<Value>, SourceError>;
}

/// Reads newline-delimited JSON exports laid out as
/// `<root>/<domain>/<YYYY-MM-DD>.jsonl`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn partition_file(&self, key: &PartitionKey) -> PathBuf {
        self.root
            .join(key.domain.as_str())
            .join(format!("{}.jsonl", key.date.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl RecordSource for DirectorySource {
    async fn extract(&self, key: &PartitionKey) -> Result<Vec<Value>, SourceError> {
        let path = self.partition_file(key);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SourceError::Unavailable {
                    partition: key.to_string(),
                    reason: format!("{}: {e}", path.display()),
                })
            }
        };

        let mut records = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(v) => records.push(v),
                Err(e) => {
                    METRICS.inc_records_skipped();
                    warn!(partition = %key, line = idx + 1, reason = %e, "skipping unparseable record");
                }
            }
        }
        Ok(records)
    }
}
