//! Table maintenance: compaction followed by version expiry.
//!
//! Runs on its own cadence, independent of ingestion. A table that fails is
//! logged and skipped; the next invocation tries again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_state::{CompactReport, ExpireReport, Layer, TableId, TableStore};
use tracing::info;

use crate::error::{Result, StrataError};
use crate::metrics::METRICS;
use crate::obs;

pub const MIN_RETENTION_HOURS: u32 = 1;
pub const MAX_RETENTION_HOURS: u32 = 8760;

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub retention_hours: u32,
    pub target_layers: Vec<Layer>,
    /// Explicit table list; `None` discovers tables from the store.
    pub tables: Option<Vec<TableId>>,
    pub interval: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            retention_hours: 168,
            target_layers: vec![Layer::Silver, Layer::Gold],
            tables: None,
            interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableMaintenance {
    pub compact: CompactReport,
    pub expire: ExpireReport,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub maintained: Vec<TableMaintenance>,
    pub failed: Vec<(TableId, String)>,
}

pub struct MaintenanceJob {
    tables: Arc<dyn TableStore>,
    settings: MaintenanceSettings,
}

impl MaintenanceJob {
    pub fn new(tables: Arc<dyn TableStore>, settings: MaintenanceSettings) -> Self {
        Self { tables, settings }
    }

    pub fn settings(&self) -> &MaintenanceSettings {
        &self.settings
    }

    /// Tables this job maintains.
    pub async fn targets(&self) -> Result<Vec<TableId>> {
        let tables = match &self.settings.tables {
            Some(explicit) => explicit.clone(),
            None => self.tables.list_tables().await?,
        };
        Ok(tables
            .into_iter()
            .filter(|t| self.settings.target_layers.contains(&t.layer))
            .collect())
    }

    /// Compact then expire one table with an explicit retention horizon.
    pub async fn maintain_table(
        &self,
        table: &TableId,
        retention_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<TableMaintenance> {
        if !(MIN_RETENTION_HOURS..=MAX_RETENTION_HOURS).contains(&retention_hours) {
            return Err(crate::config::ConfigError::Invalid(format!(
                "retention_hours must be within {MIN_RETENTION_HOURS}..={MAX_RETENTION_HOURS}, got {retention_hours}"
            ))
            .into());
        }
        let compact = self.tables.compact(table).await?;
        let horizon = now - chrono::Duration::hours(i64::from(retention_hours));
        let expire = self.tables.expire_versions(table, horizon).await?;
        METRICS.inc_tables_maintained();
        obs::emit_maintenance_table_done(
            &table.to_string(),
            compact.files_before,
            compact.files_after,
            expire.versions_removed,
        );
        Ok(TableMaintenance { compact, expire })
    }

    /// One invocation over every target table. Never fails as a whole
    /// because of one table.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let targets = self.targets().await?;
        info!(tables = targets.len(), retention_hours = self.settings.retention_hours, "maintenance started");
        let mut report = MaintenanceReport::default();
        for table in targets {
            match self
                .maintain_table(&table, self.settings.retention_hours, now)
                .await
            {
                Ok(done) => report.maintained.push(done),
                Err(e) => {
                    obs::emit_maintenance_error(&table.to_string(), &e);
                    report.failed.push((table, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Run every `interval` until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        log_failed_run(&e);
                    }
                }
            }
        }
    }
}

fn log_failed_run(e: &StrataError) {
    tracing::warn!(error = %e, "maintenance run failed; retrying next interval");
}
