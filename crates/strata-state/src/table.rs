//! Transaction log model shared by the table store backends.
//!
//! A table is an ordered list of [`LogEntry`] versions. Each entry lists the
//! data files active after its commit, in write order. A partition's rows are
//! read by replaying its active files oldest to newest, later files
//! overriding earlier ones key by key (merge-on-read). Compaction collapses a
//! partition's files into one; expiry drops old log entries and the files
//! only they referenced.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{StorageResult, TableId, TableRow};

/// Reference to one immutable data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMeta {
    pub id: String,
    pub partition: NaiveDate,
    pub rows: usize,
}

impl DataFileMeta {
    pub fn new(partition: NaiveDate, rows: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            partition,
            rows,
        }
    }
}

/// Kind of commit that produced a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Merge { partition: NaiveDate },
    Compact,
}

/// One committed table version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: u64,
    pub committed_at: DateTime<Utc>,
    pub operation: Operation,
    /// Active files after this commit, oldest first.
    pub files: Vec<DataFileMeta>,
}

/// Changes a merge batch would apply to a partition.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// Rows to write in the new data file (inserted and updated).
    pub changed: Vec<TableRow>,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MergePlan {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Replay `files` for one partition into a key-ordered row map.
pub fn partition_rows<'a>(
    files: impl IntoIterator<Item = &'a [TableRow]>,
) -> BTreeMap<String, TableRow> {
    let mut rows = BTreeMap::new();
    for file in files {
        for row in file {
            rows.insert(row.key.clone(), row.clone());
        }
    }
    rows
}

/// Compare an incoming batch with the partition's current rows.
///
/// Rejects batches with duplicate keys or rows from another partition; the
/// batch must already be deduplicated.
pub fn plan_merge(
    table: &TableId,
    partition: NaiveDate,
    current: &BTreeMap<String, TableRow>,
    incoming: Vec<TableRow>,
) -> StorageResult<MergePlan> {
    let mut seen = HashSet::new();
    let mut plan = MergePlan::default();
    for row in incoming {
        if row.partition != partition {
            return Err(StorageError::PartitionMismatch {
                key: row.key,
                expected: partition.to_string(),
                found: row.partition.to_string(),
            });
        }
        if !seen.insert(row.key.clone()) {
            return Err(StorageError::DuplicateKey {
                table: table.to_string(),
                key: row.key,
            });
        }
        match current.get(&row.key) {
            Some(existing) if existing == &row => plan.unchanged += 1,
            Some(_) => {
                plan.updated += 1;
                plan.changed.push(row);
            }
            None => {
                plan.inserted += 1;
                plan.changed.push(row);
            }
        }
    }
    plan.changed.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(plan)
}

/// Partitions holding more than one active file.
pub fn compaction_targets(files: &[DataFileMeta]) -> BTreeMap<NaiveDate, Vec<DataFileMeta>> {
    let mut by_partition: BTreeMap<NaiveDate, Vec<DataFileMeta>> = BTreeMap::new();
    for f in files {
        by_partition.entry(f.partition).or_default().push(f.clone());
    }
    by_partition.retain(|_, v| v.len() > 1);
    by_partition
}

/// Active file list after replacing each compacted partition's files with
/// its single rewritten file. Partition order is preserved.
pub fn apply_compaction(
    files: &[DataFileMeta],
    rewritten: &BTreeMap<NaiveDate, DataFileMeta>,
) -> Vec<DataFileMeta> {
    let mut out = Vec::new();
    let mut placed = BTreeSet::new();
    for f in files {
        match rewritten.get(&f.partition) {
            Some(new_file) => {
                if placed.insert(f.partition) {
                    out.push(new_file.clone());
                }
            }
            None => out.push(f.clone()),
        }
    }
    out
}

/// Versions and files removable when expiring entries older than `older_than`.
///
/// The latest entry is always kept.
pub fn plan_expiry(log: &[LogEntry], older_than: DateTime<Utc>) -> (Vec<u64>, Vec<String>) {
    let Some(latest) = log.iter().map(|e| e.version).max() else {
        return (Vec::new(), Vec::new());
    };
    let (expired, kept): (Vec<&LogEntry>, Vec<&LogEntry>) = log
        .iter()
        .partition(|e| e.version != latest && e.committed_at < older_than);

    let live: HashSet<&str> = kept
        .iter()
        .flat_map(|e| e.files.iter().map(|f| f.id.as_str()))
        .collect();
    let dead: BTreeSet<String> = expired
        .iter()
        .flat_map(|e| e.files.iter())
        .filter(|f| !live.contains(f.id.as_str()))
        .map(|f| f.id.clone())
        .collect();

    (
        expired.iter().map(|e| e.version).collect(),
        dead.into_iter().collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> TableId {
        "silver/x/t".parse().unwrap()
    }

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, n).unwrap()
    }

    fn row(key: &str, partition: NaiveDate, v: i64) -> TableRow {
        TableRow {
            key: key.to_string(),
            partition,
            values: [("v".to_string(), json!(v))].into_iter().collect(),
        }
    }

    #[test]
    fn later_files_override_earlier() {
        let f1 = vec![row("a", day(1), 1), row("b", day(1), 1)];
        let f2 = vec![row("a", day(1), 2)];
        let rows = partition_rows([f1.as_slice(), f2.as_slice()]);
        assert_eq!(rows["a"].values["v"], json!(2));
        assert_eq!(rows["b"].values["v"], json!(1));
    }

    #[test]
    fn plan_merge_counts_and_skips_identical() {
        let current = partition_rows([vec![row("a", day(1), 1)].as_slice()]);
        let plan = plan_merge(
            &table(),
            day(1),
            &current,
            vec![row("a", day(1), 1), row("b", day(1), 5)],
        )
        .unwrap();
        assert_eq!((plan.inserted, plan.updated, plan.unchanged), (1, 0, 1));
        assert_eq!(plan.changed.len(), 1);

        let noop = plan_merge(&table(), day(1), &current, vec![row("a", day(1), 1)]).unwrap();
        assert!(noop.is_noop());
    }

    #[test]
    fn plan_merge_rejects_duplicates_and_foreign_rows() {
        let current = BTreeMap::new();
        let dup = plan_merge(
            &table(),
            day(1),
            &current,
            vec![row("a", day(1), 1), row("a", day(1), 2)],
        );
        assert!(matches!(dup, Err(StorageError::DuplicateKey { .. })));

        let foreign = plan_merge(&table(), day(1), &current, vec![row("a", day(2), 1)]);
        assert!(matches!(
            foreign,
            Err(StorageError::PartitionMismatch { .. })
        ));
    }

    #[test]
    fn compaction_replaces_partition_files_in_place() {
        let a1 = DataFileMeta::new(day(1), 2);
        let b1 = DataFileMeta::new(day(2), 1);
        let a2 = DataFileMeta::new(day(1), 1);
        let files = vec![a1, b1.clone(), a2];
        let targets = compaction_targets(&files);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[&day(1)].len(), 2);

        let merged = DataFileMeta::new(day(1), 2);
        let rewritten = [(day(1), merged.clone())].into_iter().collect();
        let after = apply_compaction(&files, &rewritten);
        assert_eq!(after, vec![merged, b1]);
    }

    #[test]
    fn expiry_keeps_latest_and_shared_files() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);
        let f1 = DataFileMeta::new(day(1), 1);
        let f2 = DataFileMeta::new(day(1), 1);
        let log = vec![
            LogEntry {
                version: 1,
                committed_at: old,
                operation: Operation::Merge { partition: day(1) },
                files: vec![f1.clone()],
            },
            LogEntry {
                version: 2,
                committed_at: old,
                operation: Operation::Compact,
                files: vec![f2.clone()],
            },
        ];
        let (versions, files) = plan_expiry(&log, now);
        assert_eq!(versions, vec![1]);
        assert_eq!(files, vec![f1.id]);

        let (none, _) = plan_expiry(&log, old - chrono::Duration::days(1));
        assert!(none.is_empty());
    }
}
