//! Strata Core Library
//!
//! Two halves share one state layer:
//!
//! - **Backfill reconciliation**: per-domain manifests record which daily
//!   partitions reached the ingestion sink; each pass diffs the manifest
//!   against a sliding retention window and replays what is missing.
//! - **Scheduling cascade**: cron-triggered bronze assets and eager silver
//!   and gold dependents materialize one partition at a time into
//!   transactional tables, with periodic compaction and version expiry.

pub mod config;
pub mod error;
pub mod graph;
pub mod landing;
pub mod maintenance;
pub mod materializer;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod reconciler;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod schema;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod window;

pub use config::{ConfigError, StrataConfig};
pub use error::{Result, StrataError};
pub use graph::{AssetGraph, AssetNode, GraphError, TriggerKind};
pub use landing::{DeviceInfo, FsLandingStore, IngestPayload};
pub use maintenance::{MaintenanceJob, MaintenanceReport, MaintenanceSettings, TableMaintenance};
pub use materializer::{
    AssetDefinition, LayerMaterializer, LayerTransform, PartitionMaterializer, TransformContext,
};
pub use notify::{LogNotifier, MemoryNotifier, OperatorEvent, OperatorNotifier, WebhookNotifier};
pub use reconciler::{
    DomainReconciler, KeyOutcome, PassReport, ProcessReport, Reconciler, ReconcilerSettings,
};
pub use runtime::Runtime;
pub use schedule::CronSchedule;
pub use scheduler::{Scheduler, SchedulerSettings, TickTrigger, TriggerOutcome};
pub use schema::{ColumnSpec, ColumnType, SchemaError, TableSchema};
pub use sink::{HttpIngestionSink, IngestionSink, LandingDirSink, SinkError, SinkReceipt};
pub use source::{DirectorySource, RecordSource, SourceError};
pub use telemetry::init_tracing;
pub use window::{local_today, RetentionWindow};

pub use strata_state::{
    AssetId, AssetRun, Domain, Layer, Manifest, ManifestStatus, PartitionKey, RunId, RunState,
    TableId,
};
