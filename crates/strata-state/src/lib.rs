//! Strata-State: versioned persistence for Strata
//!
//! This crate owns every piece of durable state the orchestrator relies on.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: crash safety, optimistic concurrency and snapshot isolation.
//!
//! ## Key Components
//!
//! - `FsManifestStore`: per-domain partition manifests, atomically replaced
//! - `SurrealRunRegistry`: asset run state with the single-active-run rule
//! - `FsTableStore`: transactional tables with partition upsert, compaction
//!   and version expiry
//! - `fakes`: in-memory versions of all three for tests and dry runs

mod error;
pub mod fakes;
mod fs_table;
mod manifest_fs;
mod migrations;
mod schema;
pub mod storage_traits;
mod surreal_registry;
pub mod table;

pub use error::{StateError, StorageError};
pub use fs_table::FsTableStore;
pub use manifest_fs::FsManifestStore;
pub use schema::AssetRunRecord;
pub use storage_traits::{
    AssetId, AssetRun, CompactReport, CreateOutcome, Domain, ExpireReport, Layer, Manifest,
    ManifestEntry, ManifestStatus, ManifestStore, MergeReport, PartitionKey, RunId,
    RunRegistry, RunState, StartOutcome, StorageResult, TableId, TableRow, TableSnapshot,
    TableStore, TriggerSource,
};
pub use surreal_registry::SurrealRunRegistry;

/// Result type for strata-state backend setup
pub type Result<T> = std::result::Result<T, StateError>;
