//! Error taxonomy for Strata.
//!
//! Failures are classified by how the caller must react: transient failures
//! are retried up to a bound, authentication failures end the current pass,
//! and everything else fails the single key or run it belongs to.

use strata_state::{StateError, StorageError};

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::schema::SchemaError;
use crate::sink::SinkError;
use crate::source::SourceError;

/// Strata domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    /// Timeout, connection failure or 5xx; safe to retry.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Credentials rejected; ends the current pass.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The sink refused the partition for a non-transient reason.
    #[error("sink rejected partition: {0}")]
    Rejected(String),

    #[error("source read failed for {partition}: {reason}")]
    SourceRead { partition: String, reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("transform failed for {asset}: {reason}")]
    Transform { asset: String, reason: String },

    #[error("run {run_id} exceeded its deadline of {seconds}s")]
    DeadlineExceeded { run_id: String, seconds: u64 },

    #[error("could not trigger {asset} for {partition}: {reason}")]
    TriggerFailure {
        asset: String,
        partition: String,
        reason: String,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state backend error: {0}")]
    State(#[from] StateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StrataError {
    /// Retrying the same operation may succeed. Schema violations, sink
    /// rejections and declaration errors fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StrataError::Transient(_)
                | StrataError::DeadlineExceeded { .. }
                | StrataError::SourceRead { .. }
                | StrataError::Transform { .. }
                | StrataError::Storage(_)
                | StrataError::State(_)
                | StrataError::Io(_)
        )
    }

    /// The failure must end the whole reconciliation pass.
    pub fn is_auth(&self) -> bool {
        matches!(self, StrataError::Auth(_))
    }
}

impl From<SinkError> for StrataError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Transient(m) => StrataError::Transient(m),
            SinkError::Auth(m) => StrataError::Auth(m),
            SinkError::Rejected(m) => StrataError::Rejected(m),
        }
    }
}

impl From<SourceError> for StrataError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable { partition, reason } => {
                StrataError::SourceRead { partition, reason }
            }
            SourceError::Io(e) => StrataError::Io(e),
        }
    }
}

/// Result type for Strata domain operations.
pub type Result<T> = std::result::Result<T, StrataError>;
