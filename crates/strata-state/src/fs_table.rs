//! Filesystem-backed [`TableStore`].
//!
//! Layout per table:
//!
//! ```text
//! <root>/<layer>/<domain>/<name>/
//!   _log/<version, 20 digits>.json   one LogEntry per committed version
//!   data/<file id>.json              immutable row files
//! ```
//!
//! Data files are written first and become visible only once the log entry
//! naming them exists. Log entries are created with a no-clobber rename, so
//! two writers can never both commit the same version. Snapshots hold a read
//! lock that version expiry waits on, so expiry never deletes a file a
//! reader is replaying.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::*;
use crate::table::{self, DataFileMeta, LogEntry, Operation};

const LOG_DIR: &str = "_log";
const DATA_DIR: &str = "data";

/// Table store rooted at a directory.
#[derive(Debug)]
pub struct FsTableStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    files_lock: RwLock<()>,
}

impl FsTableStore {
    /// Open (creating if needed) a table root.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            files_lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &TableId) -> PathBuf {
        self.root
            .join(table.layer.as_str())
            .join(table.domain.as_str())
            .join(&table.name)
    }

    fn read_log(dir: &Path) -> StorageResult<Vec<LogEntry>> {
        let log_dir = dir.join(LOG_DIR);
        let entries = match fs::read_dir(&log_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut log = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            log.push(serde_json::from_slice::<LogEntry>(&bytes)?);
        }
        log.sort_by_key(|e| e.version);
        Ok(log)
    }

    /// Newest log entry. Names are zero-padded versions, so the greatest
    /// name is the greatest version.
    fn latest(dir: &Path) -> StorageResult<Option<LogEntry>> {
        let log_dir = dir.join(LOG_DIR);
        let entries = match fs::read_dir(&log_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut newest: Option<PathBuf> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if newest.as_ref().map_or(true, |n| path.file_name() > n.file_name()) {
                newest = Some(path);
            }
        }
        match newest {
            Some(path) => Ok(Some(serde_json::from_slice(&fs::read(path)?)?)),
            None => Ok(None),
        }
    }

    fn read_data(dir: &Path, id: &str) -> StorageResult<Vec<TableRow>> {
        let bytes = fs::read(dir.join(DATA_DIR).join(format!("{id}.json")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_data(dir: &Path, meta: &DataFileMeta, rows: &[TableRow]) -> StorageResult<()> {
        let data_dir = dir.join(DATA_DIR);
        fs::create_dir_all(&data_dir)?;
        let mut tmp = NamedTempFile::new_in(&data_dir)?;
        tmp.write_all(&serde_json::to_vec(rows)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(data_dir.join(format!("{}.json", meta.id)))?;
        Ok(())
    }

    fn write_log_entry(dir: &Path, table: &TableId, entry: &LogEntry) -> StorageResult<()> {
        let log_dir = dir.join(LOG_DIR);
        fs::create_dir_all(&log_dir)?;
        let mut tmp = NamedTempFile::new_in(&log_dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(entry)?)?;
        tmp.as_file().sync_all()?;
        let path = log_dir.join(format!("{:020}.json", entry.version));
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StorageError::VersionConflict {
                    resource: format!("table/{table}"),
                    expected: entry.version - 1,
                    found: entry.version,
                }
            } else {
                StorageError::Io(e.error)
            }
        })?;
        Ok(())
    }

    /// Replay the given active files per partition.
    fn load_rows(
        dir: &Path,
        files: &[DataFileMeta],
        partition: Option<NaiveDate>,
    ) -> StorageResult<BTreeMap<NaiveDate, BTreeMap<String, TableRow>>> {
        let mut by_partition: BTreeMap<NaiveDate, Vec<Vec<TableRow>>> = BTreeMap::new();
        for f in files {
            if partition.is_some_and(|p| p != f.partition) {
                continue;
            }
            by_partition
                .entry(f.partition)
                .or_default()
                .push(Self::read_data(dir, &f.id)?);
        }
        Ok(by_partition
            .into_iter()
            .map(|(p, files)| (p, table::partition_rows(files.iter().map(Vec::as_slice))))
            .collect())
    }
}

#[async_trait]
impl TableStore for FsTableStore {
    async fn merge_partition(
        &self,
        table: &TableId,
        partition: NaiveDate,
        rows: Vec<TableRow>,
    ) -> StorageResult<MergeReport> {
        let _guard = self.write_lock.lock().await;
        let dir = self.table_dir(table);
        let latest = Self::latest(&dir)?;
        let (version, active) = latest
            .map(|e| (e.version, e.files))
            .unwrap_or((0, Vec::new()));

        let current = Self::load_rows(&dir, &active, Some(partition))?
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
            debug!(table = %table, %partition, "merge changed nothing; no version written");
            return Ok(report);
        }

        let meta = DataFileMeta::new(partition, plan.changed.len());
        Self::write_data(&dir, &meta, &plan.changed)?;

        let mut files = active;
        files.push(meta);
        let entry = LogEntry {
            version: version + 1,
            committed_at: Utc::now(),
            operation: Operation::Merge { partition },
            files,
        };
        Self::write_log_entry(&dir, table, &entry)?;

        report.version = entry.version;
        report.committed = true;
        debug!(
            table = %table,
            %partition,
            version = entry.version,
            inserted = report.inserted,
            updated = report.updated,
            "partition merged"
        );
        Ok(report)
    }

    async fn snapshot(
        &self,
        table: &TableId,
        partition: Option<NaiveDate>,
    ) -> StorageResult<TableSnapshot> {
        let _files = self.files_lock.read().await;
        let dir = self.table_dir(table);
        let latest = Self::latest(&dir)?.ok_or_else(|| StorageError::TableNotFound {
            table: table.to_string(),
        })?;
        let rows = Self::load_rows(&dir, &latest.files, partition)?
            .into_values()
            .flat_map(|m| m.into_values())
            .collect();
        Ok(TableSnapshot {
            table: table.clone(),
            version: latest.version,
            rows,
        })
    }

    async fn list_tables(&self) -> StorageResult<Vec<TableId>> {
        let mut out = Vec::new();
        for layer in [Layer::Bronze, Layer::Silver, Layer::Gold] {
            let layer_dir = self.root.join(layer.as_str());
            let Ok(domains) = fs::read_dir(&layer_dir) else {
                continue;
            };
            for domain in domains {
                let domain_path = domain?.path();
                let Some(domain) = domain_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| Domain::new(n).ok())
                else {
                    continue;
                };
                for name in fs::read_dir(&domain_path)? {
                    let name_path = name?.path();
                    let Some(name) = name_path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !name_path.join(LOG_DIR).is_dir() {
                        continue;
                    }
                    if let Ok(id) = AssetId::new(layer, domain.clone(), name) {
                        out.push(id);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn compact(&self, table: &TableId) -> StorageResult<CompactReport> {
        let _guard = self.write_lock.lock().await;
        let dir = self.table_dir(table);
        let latest = Self::latest(&dir)?.ok_or_else(|| StorageError::TableNotFound {
            table: table.to_string(),
        })?;

        let targets = table::compaction_targets(&latest.files);
        let files_before = latest.files.len();
        if targets.is_empty() {
            return Ok(CompactReport {
                table: table.clone(),
                files_before,
                files_after: files_before,
                version: None,
            });
        }

        let mut rewritten = BTreeMap::new();
        for (partition, files) in &targets {
            let rows = Self::load_rows(&dir, files, Some(*partition))?
                .remove(partition)
                .unwrap_or_default();
            let rows: Vec<TableRow> = rows.into_values().collect();
            let meta = DataFileMeta::new(*partition, rows.len());
            Self::write_data(&dir, &meta, &rows)?;
            rewritten.insert(*partition, meta);
        }

        let entry = LogEntry {
            version: latest.version + 1,
            committed_at: Utc::now(),
            operation: Operation::Compact,
            files: table::apply_compaction(&latest.files, &rewritten),
        };
        Self::write_log_entry(&dir, table, &entry)?;

        info!(
            table = %table,
            version = entry.version,
            files_before,
            files_after = entry.files.len(),
            "table compacted"
        );
        Ok(CompactReport {
            table: table.clone(),
            files_before,
            files_after: entry.files.len(),
            version: Some(entry.version),
        })
    }

    async fn expire_versions(
        &self,
        table: &TableId,
        older_than: DateTime<Utc>,
    ) -> StorageResult<ExpireReport> {
        let _guard = self.write_lock.lock().await;
        let dir = self.table_dir(table);
        let log = Self::read_log(&dir)?;
        if log.is_empty() {
            return Err(StorageError::TableNotFound {
                table: table.to_string(),
            });
        }

        let (versions, files) = table::plan_expiry(&log, older_than);
        let _files = self.files_lock.write().await;
        // Log entries go first: a dangling data file is harmless, a log entry
        // naming a deleted file is not.
        for v in &versions {
            fs::remove_file(dir.join(LOG_DIR).join(format!("{v:020}.json")))?;
        }
        for id in &files {
            match fs::remove_file(dir.join(DATA_DIR).join(format!("{id}.json"))) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            table = %table,
            versions_removed = versions.len(),
            files_removed = files.len(),
            "expired table versions"
        );
        Ok(ExpireReport {
            table: table.clone(),
            versions_removed: versions.len(),
            files_removed: files.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_store() -> (tempfile::TempDir, FsTableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsTableStore::open(dir.path().join("tables")).unwrap();
        (dir, store)
    }

    fn table() -> TableId {
        "silver/screen_time/app_usage".parse().unwrap()
    }

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, n).unwrap()
    }

    fn row(key: &str, partition: NaiveDate, minutes: i64) -> TableRow {
        TableRow {
            key: key.to_string(),
            partition,
            values: [("minutes".to_string(), json!(minutes))]
                .into_iter()
                .collect(),
        }
    }

    #[tokio::test]
    async fn merge_then_snapshot() {
        let (_dir, store) = make_store();
        let report = store
            .merge_partition(&table(), day(1), vec![row("a", day(1), 3), row("b", day(1), 4)])
            .await
            .unwrap();
        assert!(report.committed);
        assert_eq!(report.version, 1);
        assert_eq!(report.inserted, 2);

        let snap = store.snapshot(&table(), None).await.unwrap();
        assert_eq!(snap.rows.len(), 2);
        assert_eq!(store.list_tables().await.unwrap(), vec![table()]);
    }

    #[tokio::test]
    async fn identical_merge_writes_no_version() {
        let (_dir, store) = make_store();
        let rows = vec![row("a", day(1), 3)];
        store
            .merge_partition(&table(), day(1), rows.clone())
            .await
            .unwrap();
        let before = store.snapshot(&table(), None).await.unwrap();

        let again = store.merge_partition(&table(), day(1), rows).await.unwrap();
        assert!(!again.committed);
        assert_eq!(again.unchanged, 1);

        let after = store.snapshot(&table(), None).await.unwrap();
        assert_eq!(before.version, after.version);
        assert_eq!(before.digest(), after.digest());
    }

    #[tokio::test]
    async fn upsert_updates_only_matching_partition() {
        let (_dir, store) = make_store();
        store
            .merge_partition(&table(), day(1), vec![row("a", day(1), 1)])
            .await
            .unwrap();
        store
            .merge_partition(&table(), day(2), vec![row("a", day(2), 7)])
            .await
            .unwrap();
        let report = store
            .merge_partition(&table(), day(1), vec![row("a", day(1), 2)])
            .await
            .unwrap();
        assert_eq!(report.updated, 1);

        let d1 = store.snapshot(&table(), Some(day(1))).await.unwrap();
        assert_eq!(d1.rows, vec![row("a", day(1), 2)]);
        let d2 = store.snapshot(&table(), Some(day(2))).await.unwrap();
        assert_eq!(d2.rows, vec![row("a", day(2), 7)]);
    }

    #[tokio::test]
    async fn compact_then_expire_preserves_rows() {
        let (_dir, store) = make_store();
        for minutes in 1..=3 {
            store
                .merge_partition(
                    &table(),
                    day(1),
                    vec![row("a", day(1), minutes), row(&format!("k{minutes}"), day(1), 0)],
                )
                .await
                .unwrap();
        }
        let before = store.snapshot(&table(), None).await.unwrap();

        let compacted = store.compact(&table()).await.unwrap();
        assert_eq!(compacted.files_before, 3);
        assert_eq!(compacted.files_after, 1);

        let expired = store
            .expire_versions(&table(), Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired.versions_removed, 3);
        assert_eq!(expired.files_removed, 3);

        let after = store.snapshot(&table(), None).await.unwrap();
        assert_eq!(before.rows, after.rows);
        assert_eq!(after.version, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_survive_concurrent_expiry() {
        let (_dir, store) = make_store();
        let store = std::sync::Arc::new(store);
        for minutes in 1..=20 {
            store
                .merge_partition(&table(), day(1), vec![row(&format!("k{minutes}"), day(1), minutes)])
                .await
                .unwrap();
        }
        store.compact(&table()).await.unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        let snap = store.snapshot(&table(), None).await.unwrap();
                        assert_eq!(snap.rows.len(), 20);
                    }
                })
            })
            .collect();
        let expired = store
            .expire_versions(&table(), Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(expired.versions_removed, 20);
        assert_eq!(store.snapshot(&table(), None).await.unwrap().version, 21);
    }

    #[tokio::test]
    async fn snapshot_of_unknown_table_fails() {
        let (_dir, store) = make_store();
        let err = store.snapshot(&table(), None).await.unwrap_err();
        assert!(matches!(err, StorageError::TableNotFound { .. }));
    }
}
