//! SurrealDB-backed RunRegistry implementation
//!
//! Uses `schema::AssetRunRecord` for persistence, converting to/from
//! `storage_traits` types at the boundary. Every read-check-write sequence
//! runs under one async lock, which is what upholds the single active run
//! rule for concurrent triggers within the process.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::AssetRunRecord;
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`RunRegistry`].
pub struct SurrealRunRegistry {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
}

impl SurrealRunRegistry {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `strata/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`,
    /// `ws://host:port`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        if let Some(path) = url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("strata")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        let mut res = db
            .query("SELECT seq FROM asset_runs ORDER BY seq DESC LIMIT 1")
            .await?;
        let last: Option<u64> = res.take((0, "seq"))?;

        info!(url = %url, "SurrealRunRegistry connected");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(last.map_or(0, |s| s + 1)),
        })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch(&self, run_id: &RunId) -> StorageResult<AssetRunRecord> {
        let rid_owned = run_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM asset_runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<AssetRunRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn fetch_latest(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
    ) -> StorageResult<Option<AssetRunRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM asset_runs WHERE asset = $asset AND partition_date = $date \
                 ORDER BY seq DESC LIMIT 1",
            )
            .bind(("asset", asset.to_string()))
            .bind(("date", partition.date.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<AssetRunRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn store(&self, mut row: AssetRunRecord) -> StorageResult<()> {
        row.id = None;
        let rid_owned = row.run_id.clone();
        self.db
            .query("UPDATE asset_runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RunRegistry for SurrealRunRegistry {
    async fn create(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
        trigger: TriggerSource,
        attempt: u32,
    ) -> StorageResult<CreateOutcome> {
        let _guard = self.write_lock.lock().await;

        // Only the latest run can be non-terminal: creation is refused
        // while one is active.
        if let Some(latest) = self.fetch_latest(asset, partition).await? {
            let run = latest.into_run()?;
            if !run.state.is_terminal() {
                return Ok(CreateOutcome::AlreadyActive(run));
            }
        }

        let run = AssetRun::new_pending(asset.clone(), partition.clone(), trigger, attempt);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(run_id = %run.run_id, asset = %asset, partition = %partition, "creating run");

        let _created: Option<AssetRunRecord> = self
            .db
            .create("asset_runs")
            .content(AssetRunRecord::from_run(&run, seq))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(CreateOutcome::Created(run))
    }

    async fn start(&self, run_id: &RunId, gate: &[AssetId]) -> StorageResult<StartOutcome> {
        let _guard = self.write_lock.lock().await;

        let row = self.fetch(run_id).await?;
        let seq = row.seq;
        let mut run = row.into_run()?;
        if run.state != RunState::Pending {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: run.state.to_string(),
                expected: "pending".to_string(),
            });
        }

        for upstream in gate {
            let ok = match self.fetch_latest(upstream, &run.partition).await? {
                Some(r) => r.state == RunState::Succeeded.as_str(),
                None => false,
            };
            if !ok {
                return Ok(StartOutcome::Blocked {
                    upstream: upstream.clone(),
                });
            }
        }

        run.state = RunState::Running;
        run.started_at = Some(Utc::now());
        self.store(AssetRunRecord::from_run(&run, seq)).await?;
        Ok(StartOutcome::Started(run))
    }

    async fn finish(
        &self,
        run_id: &RunId,
        state: RunState,
        error: Option<String>,
    ) -> StorageResult<AssetRun> {
        let _guard = self.write_lock.lock().await;

        let row = self.fetch(run_id).await?;
        let seq = row.seq;
        let mut run = row.into_run()?;
        check_finish(&run, state)?;

        run.state = state;
        run.error = error;
        run.finished_at = Some(Utc::now());
        self.store(AssetRunRecord::from_run(&run, seq)).await?;
        Ok(run)
    }

    async fn get(&self, run_id: &RunId) -> StorageResult<AssetRun> {
        self.fetch(run_id).await?.into_run()
    }

    async fn latest(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
    ) -> StorageResult<Option<AssetRun>> {
        self.fetch_latest(asset, partition)
            .await?
            .map(AssetRunRecord::into_run)
            .transpose()
    }

    async fn list(&self, asset: Option<&AssetId>) -> StorageResult<Vec<AssetRun>> {
        let mut res = match asset {
            Some(a) => self
                .db
                .query("SELECT * FROM asset_runs WHERE asset = $asset ORDER BY seq DESC")
                .bind(("asset", a.to_string()))
                .await,
            None => {
                self.db
                    .query("SELECT * FROM asset_runs ORDER BY seq DESC")
                    .await
            }
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<AssetRunRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(AssetRunRecord::into_run).collect()
    }

    async fn fail_interrupted(&self, reason: &str) -> StorageResult<Vec<AssetRun>> {
        let _guard = self.write_lock.lock().await;

        let mut res = self
            .db
            .query("SELECT * FROM asset_runs WHERE state IN ['pending', 'running'] ORDER BY seq")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<AssetRunRecord> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in rows {
            let seq = row.seq;
            let mut run = row.into_run()?;
            run.state = RunState::Failed;
            run.error = Some(reason.to_string());
            run.finished_at = Some(Utc::now());
            self.store(AssetRunRecord::from_run(&run, seq)).await?;
            warn!(run_id = %run.run_id, asset = %run.asset, partition = %run.partition, "failing interrupted run");
            failed.push(run);
        }
        Ok(failed)
    }
}
