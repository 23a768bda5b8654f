//! Structured lifecycle events for reconciliation, runs and maintenance.
//!
//! Every helper logs a fixed `event` name so log pipelines can filter on it.
//! Failure events always carry the partition key and the reason.

use tracing::{error, info, warn};

/// Span tagging everything a run logs with its id, asset and partition.
///
/// Attach it with `tracing::Instrument` so it follows the run's task across
/// await points.
pub fn run_span(run_id: &str, asset: &str, partition: &str) -> tracing::Span {
    tracing::info_span!("strata.run", run_id = %run_id, asset = %asset, partition = %partition)
}

pub fn emit_reconcile_started(domain: &str, floor: &str, ceiling: &str, missing: usize) {
    info!(event = "reconcile.started", domain = %domain, floor = %floor, ceiling = %ceiling, missing = missing);
}

pub fn emit_key_committed(partition: &str, records: usize) {
    info!(event = "reconcile.key_committed", partition = %partition, records = records);
}

pub fn emit_key_failed(partition: &str, attempt: u32, status: &str, reason: &dyn std::fmt::Display) {
    warn!(
        event = "reconcile.key_failed",
        partition = %partition,
        attempt = attempt,
        status = %status,
        reason = %reason,
    );
}

pub fn emit_partition_lost(partition: &str, status: &str) {
    error!(event = "reconcile.partition_lost", partition = %partition, status = %status);
}

pub fn emit_reconcile_finished(domain: &str, committed: usize, failed: usize, aborted: bool) {
    info!(
        event = "reconcile.finished",
        domain = %domain,
        committed = committed,
        failed = failed,
        aborted = aborted,
    );
}

pub fn emit_run_started(run_id: &str, asset: &str, partition: &str, attempt: u32) {
    info!(event = "run.started", run_id = %run_id, asset = %asset, partition = %partition, attempt = attempt);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(event = "run.finished", run_id = %run_id, duration_ms = duration_ms, success = success);
}

pub fn emit_run_failed(run_id: &str, asset: &str, partition: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, asset = %asset, partition = %partition, reason = %reason);
}

pub fn emit_trigger_rejected(asset: &str, partition: &str, active_run: &str) {
    info!(event = "trigger.rejected", asset = %asset, partition = %partition, active_run = %active_run);
}

pub fn emit_maintenance_table_done(table: &str, files_before: usize, files_after: usize, versions_removed: usize) {
    info!(
        event = "maintenance.table_done",
        table = %table,
        files_before = files_before,
        files_after = files_after,
        versions_removed = versions_removed,
    );
}

pub fn emit_maintenance_error(table: &str, error: &dyn std::fmt::Display) {
    warn!(event = "maintenance.table_error", table = %table, error = %error);
}
