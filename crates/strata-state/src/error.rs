//! Error types for strata-state

use thiserror::Error;

/// Errors raised while opening or migrating a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Filesystem error while opening a store root
    #[error("Store root unavailable: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A domain name failed validation.
    #[error("invalid domain '{domain}': must match [a-z][a-z0-9_]*")]
    InvalidDomain { domain: String },

    /// An asset identifier could not be parsed.
    #[error("invalid asset id '{id}': expected <layer>/<domain>/<name>")]
    InvalidAssetId { id: String },

    /// Optimistic concurrency check failed on a versioned write.
    #[error("version conflict on {resource}: expected {expected}, found {found}")]
    VersionConflict {
        resource: String,
        expected: u64,
        found: u64,
    },

    /// Run does not exist in the registry.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state the transition requires.
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Table has never been written.
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// A merge batch carried the same natural key twice.
    #[error("duplicate key '{key}' in merge batch for {table}")]
    DuplicateKey { table: String, key: String },

    /// A merge batch carried a row for a different partition.
    #[error("row '{key}' belongs to partition {found}, merge targets {expected}")]
    PartitionMismatch {
        key: String,
        expected: String,
        found: String,
    },

    /// Underlying filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (query, transport).
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<tempfile::PersistError> for StorageError {
    fn from(err: tempfile::PersistError) -> Self {
        StorageError::Io(err.error)
    }
}
