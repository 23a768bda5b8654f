//! In-memory fakes for storage traits (testing and dry runs)
//!
//! Provides `MemoryManifestStore`, `MemoryRunRegistry`, and
//! `MemoryTableStore` that satisfy the trait contracts without touching disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::storage_traits::*;
use crate::table::{self, DataFileMeta, LogEntry, Operation};

// ---------------------------------------------------------------------------
// MemoryManifestStore
// ---------------------------------------------------------------------------

/// In-memory manifest store keyed by domain.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    manifests: Mutex<BTreeMap<Domain, Manifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn load(&self, domain: &Domain) -> StorageResult<Manifest> {
        let manifests = self.manifests.lock().await;
        Ok(manifests
            .get(domain)
            .cloned()
            .unwrap_or_else(|| Manifest::empty(domain.clone())))
    }

    async fn commit(&self, manifest: &Manifest) -> StorageResult<u64> {
        let mut manifests = self.manifests.lock().await;
        let stored = manifests.get(&manifest.domain).map(|m| m.version).unwrap_or(0);
        if stored != manifest.version {
            return Err(StorageError::VersionConflict {
                resource: format!("manifest/{}", manifest.domain),
                expected: manifest.version,
                found: stored,
            });
        }
        let mut next = manifest.clone();
        next.version += 1;
        let version = next.version;
        manifests.insert(next.domain.clone(), next);
        Ok(version)
    }

    async fn domains(&self) -> StorageResult<Vec<Domain>> {
        Ok(self.manifests.lock().await.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunRegistry
// ---------------------------------------------------------------------------

/// In-memory run registry; runs are kept in creation order.
#[derive(Debug, Default)]
pub struct MemoryRunRegistry {
    runs: Mutex<Vec<AssetRun>>,
}

impl MemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn latest_of<'a>(
    runs: &'a [AssetRun],
    asset: &AssetId,
    partition: &PartitionKey,
) -> Option<&'a AssetRun> {
    runs.iter()
        .rev()
        .find(|r| &r.asset == asset && &r.partition == partition)
}

#[async_trait]
impl RunRegistry for MemoryRunRegistry {
    async fn create(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
        trigger: TriggerSource,
        attempt: u32,
    ) -> StorageResult<CreateOutcome> {
        let mut runs = self.runs.lock().await;
        if let Some(active) = runs
            .iter()
            .find(|r| &r.asset == asset && &r.partition == partition && !r.state.is_terminal())
        {
            return Ok(CreateOutcome::AlreadyActive(active.clone()));
        }
        let run = AssetRun::new_pending(asset.clone(), partition.clone(), trigger, attempt);
        runs.push(run.clone());
        Ok(CreateOutcome::Created(run))
    }

    async fn start(&self, run_id: &RunId, gate: &[AssetId]) -> StorageResult<StartOutcome> {
        let mut runs = self.runs.lock().await;
        let idx = runs
            .iter()
            .position(|r| &r.run_id == run_id)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if runs[idx].state != RunState::Pending {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: runs[idx].state.to_string(),
                expected: "pending".to_string(),
            });
        }
        let date = runs[idx].partition.date;
        for upstream in gate {
            let upstream_key = PartitionKey::new(upstream.domain.clone(), date);
            let ok = latest_of(&runs, upstream, &upstream_key)
                .is_some_and(|r| r.state == RunState::Succeeded);
            if !ok {
                return Ok(StartOutcome::Blocked {
                    upstream: upstream.clone(),
                });
            }
        }
        let run = &mut runs[idx];
        run.state = RunState::Running;
        run.started_at = Some(Utc::now());
        Ok(StartOutcome::Started(run.clone()))
    }

    async fn finish(
        &self,
        run_id: &RunId,
        state: RunState,
        error: Option<String>,
    ) -> StorageResult<AssetRun> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .iter_mut()
            .find(|r| &r.run_id == run_id)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        check_finish(run, state)?;
        run.state = state;
        run.error = error;
        run.finished_at = Some(Utc::now());
        Ok(run.clone())
    }

    async fn get(&self, run_id: &RunId) -> StorageResult<AssetRun> {
        let runs = self.runs.lock().await;
        runs.iter()
            .find(|r| &r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn latest(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
    ) -> StorageResult<Option<AssetRun>> {
        let runs = self.runs.lock().await;
        Ok(latest_of(&runs, asset, partition).cloned())
    }

    async fn list(&self, asset: Option<&AssetId>) -> StorageResult<Vec<AssetRun>> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .rev()
            .filter(|r| asset.map_or(true, |a| &r.asset == a))
            .cloned()
            .collect())
    }

    async fn fail_interrupted(&self, reason: &str) -> StorageResult<Vec<AssetRun>> {
        let mut runs = self.runs.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for run in runs.iter_mut().filter(|r| !r.state.is_terminal()) {
            run.state = RunState::Failed;
            run.error = Some(reason.to_string());
            run.finished_at = Some(now);
            failed.push(run.clone());
        }
        Ok(failed)
    }
}

// ---------------------------------------------------------------------------
// MemoryTableStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemTable {
    log: Vec<LogEntry>,
    data: HashMap<String, Arc<Vec<TableRow>>>,
}

impl MemTable {
    fn active(&self) -> (u64, Vec<DataFileMeta>) {
        self.log
            .last()
            .map(|e| (e.version, e.files.clone()))
            .unwrap_or((0, Vec::new()))
    }

    fn rows(
        &self,
        files: &[DataFileMeta],
        partition: Option<NaiveDate>,
    ) -> BTreeMap<NaiveDate, BTreeMap<String, TableRow>> {
        let mut by_partition: BTreeMap<NaiveDate, Vec<Arc<Vec<TableRow>>>> = BTreeMap::new();
        for f in files {
            if partition.is_some_and(|p| p != f.partition) {
                continue;
            }
            if let Some(data) = self.data.get(&f.id) {
                by_partition.entry(f.partition).or_default().push(data.clone());
            }
        }
        by_partition
            .into_iter()
            .map(|(p, files)| (p, table::partition_rows(files.iter().map(|f| f.as_slice()))))
            .collect()
    }
}

/// In-memory table store with the same log semantics as the file store.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<TableId, MemTable>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn merge_partition(
        &self,
        table: &TableId,
        partition: NaiveDate,
        rows: Vec<TableRow>,
    ) -> StorageResult<MergeReport> {
        let mut tables = self.tables.lock().await;
        let t = tables.entry(table.clone()).or_default();
        let (version, mut files) = t.active();
        let current = t
            .rows(&files, Some(partition))
            .remove(&partition)
            .unwrap_or_default();
        let plan = table::plan_merge(table, partition, &current, rows)?;

        let mut report = MergeReport {
            table: table.clone(),
            partition,
            version,
            inserted: plan.inserted,
            updated: plan.updated,
            unchanged: plan.unchanged,
            committed: false,
        };
        if plan.is_noop() {
            return Ok(report);
        }

        let meta = DataFileMeta::new(partition, plan.changed.len());
        t.data.insert(meta.id.clone(), Arc::new(plan.changed));
        files.push(meta);
        t.log.push(LogEntry {
            version: version + 1,
            committed_at: Utc::now(),
            operation: Operation::Merge { partition },
            files,
        });
        report.version = version + 1;
        report.committed = true;
        Ok(report)
    }

    async fn snapshot(
        &self,
        table: &TableId,
        partition: Option<NaiveDate>,
    ) -> StorageResult<TableSnapshot> {
        let tables = self.tables.lock().await;
        let t = tables
            .get(table)
            .filter(|t| !t.log.is_empty())
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.to_string(),
            })?;
        let (version, files) = t.active();
        let rows = t
            .rows(&files, partition)
            .into_values()
            .flat_map(|m| m.into_values())
            .collect();
        Ok(TableSnapshot {
            table: table.clone(),
            version,
            rows,
        })
    }

    async fn list_tables(&self) -> StorageResult<Vec<TableId>> {
        let tables = self.tables.lock().await;
        let mut ids: Vec<TableId> = tables
            .iter()
            .filter(|(_, t)| !t.log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn compact(&self, table: &TableId) -> StorageResult<CompactReport> {
        let mut tables = self.tables.lock().await;
        let t = tables
            .get_mut(table)
            .filter(|t| !t.log.is_empty())
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.to_string(),
            })?;
        let (version, files) = t.active();
        let targets = table::compaction_targets(&files);
        if targets.is_empty() {
            return Ok(CompactReport {
                table: table.clone(),
                files_before: files.len(),
                files_after: files.len(),
                version: None,
            });
        }

        let mut rewritten = BTreeMap::new();
        for (partition, group) in &targets {
            let rows: Vec<TableRow> = t
                .rows(group, Some(*partition))
                .remove(partition)
                .unwrap_or_default()
                .into_values()
                .collect();
            let meta = DataFileMeta::new(*partition, rows.len());
            t.data.insert(meta.id.clone(), Arc::new(rows));
            rewritten.insert(*partition, meta);
        }
        let new_files = table::apply_compaction(&files, &rewritten);
        let files_after = new_files.len();
        t.log.push(LogEntry {
            version: version + 1,
            committed_at: Utc::now(),
            operation: Operation::Compact,
            files: new_files,
        });
        Ok(CompactReport {
            table: table.clone(),
            files_before: files.len(),
            files_after,
            version: Some(version + 1),
        })
    }

    async fn expire_versions(
        &self,
        table: &TableId,
        older_than: DateTime<Utc>,
    ) -> StorageResult<ExpireReport> {
        let mut tables = self.tables.lock().await;
        let t = tables
            .get_mut(table)
            .filter(|t| !t.log.is_empty())
            .ok_or_else(|| StorageError::TableNotFound {
                table: table.to_string(),
            })?;
        let (versions, files) = table::plan_expiry(&t.log, older_than);
        t.log.retain(|e| !versions.contains(&e.version));
        for id in &files {
            t.data.remove(id);
        }
        Ok(ExpireReport {
            table: table.clone(),
            versions_removed: versions.len(),
            files_removed: files.len(),
        })
    }
}
