//! Storage trait definitions for Strata
//!
//! These traits define the core storage abstractions:
//! - `ManifestStore`: per-domain record of committed partitions (versioned)
//! - `RunRegistry`: authority for asset run state (at most one active run
//!   per asset and partition)
//! - `TableStore`: transactional tables with partition-scoped upsert and
//!   snapshot reads
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Data domain (e.g. `screen_time`, `location`).
///
/// Always matches `[a-z][a-z0-9_]*`; domains become path segments, so the
/// inner field is private and only reachable through validation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);

impl Domain {
    pub fn new(name: impl Into<String>) -> StorageResult<Self> {
        Self::try_from(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Domain {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if !is_identifier(&s) {
            return Err(StorageError::InvalidDomain { domain: s });
        }
        Ok(Domain(s))
    }
}

impl From<Domain> for String {
    fn from(d: Domain) -> Self {
        d.0
    }
}

impl FromStr for Domain {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The atomic unit of ingestion and materialization.
///
/// Ordered by `(domain, date)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub domain: Domain,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(domain: Domain, date: NaiveDate) -> Self {
        Self { domain, date }
    }

    /// Directory segment used by landing storage, e.g. `2024_03_01`.
    pub fn date_segment(&self) -> String {
        self.date.format("%Y_%m_%d").to_string()
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.date)
    }
}

/// Medallion layer of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Bronze => "bronze",
            Layer::Silver => "silver",
            Layer::Gold => "gold",
        }
    }
}

impl FromStr for Layer {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Layer::Bronze),
            "silver" => Ok(Layer::Silver),
            "gold" => Ok(Layer::Gold),
            other => Err(StorageError::InvalidAssetId {
                id: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies an asset and the transactional table it materializes into.
///
/// Rendered as `<layer>/<domain>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId {
    pub layer: Layer,
    pub domain: Domain,
    pub name: String,
}

/// Tables share their identity with the asset that writes them.
pub type TableId = AssetId;

impl AssetId {
    pub fn new(layer: Layer, domain: Domain, name: impl Into<String>) -> StorageResult<Self> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(StorageError::InvalidAssetId {
                id: format!("{layer}/{domain}/{name}"),
            });
        }
        Ok(Self {
            layer,
            domain,
            name,
        })
    }
}

impl TryFrom<String> for AssetId {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let invalid = || StorageError::InvalidAssetId { id: s.clone() };
        let mut parts = s.split('/');
        let (Some(layer), Some(domain), Some(name), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let layer = layer.parse::<Layer>().map_err(|_| invalid())?;
        let domain = Domain::new(domain).map_err(|_| invalid())?;
        AssetId::new(layer, domain, name)
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> Self {
        id.to_string()
    }
}

impl FromStr for AssetId {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.layer, self.domain, self.name)
    }
}

// ---------------------------------------------------------------------------
// ManifestStore: committed partitions per domain
// ---------------------------------------------------------------------------

/// Reconciliation status of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Pending,
    Committed,
    Failed,
}

/// Manifest record for one partition date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub status: ManifestStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ManifestEntry {
    pub fn pending() -> Self {
        Self {
            status: ManifestStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

/// Persisted manifest for one domain.
///
/// `version` is the optimistic-concurrency token: a store only accepts a
/// commit whose `version` equals the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub domain: Domain,
    pub version: u64,
    /// Oldest date of the window seen by the last pass.
    #[serde(default)]
    pub window_floor: Option<NaiveDate>,
    #[serde(default)]
    pub entries: BTreeMap<NaiveDate, ManifestEntry>,
}

impl Manifest {
    pub fn empty(domain: Domain) -> Self {
        Self {
            domain,
            version: 0,
            window_floor: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn status(&self, date: NaiveDate) -> Option<ManifestStatus> {
        self.entries.get(&date).map(|e| e.status)
    }

    /// Dates currently committed.
    pub fn committed(&self) -> BTreeSet<NaiveDate> {
        self.dates_with(ManifestStatus::Committed)
    }

    pub fn dates_with(&self, status: ManifestStatus) -> BTreeSet<NaiveDate> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(d, _)| *d)
            .collect()
    }

    /// Record a confirmed delivery.
    pub fn mark_committed(&mut self, date: NaiveDate, at: DateTime<Utc>) {
        let entry = self.entries.entry(date).or_insert_with(ManifestEntry::pending);
        entry.status = ManifestStatus::Committed;
        entry.attempt_count += 1;
        entry.last_attempt_at = Some(at);
        entry.last_error = None;
    }

    /// Record a failed attempt and return the resulting status.
    ///
    /// A committed entry is never downgraded; its status is returned as is.
    pub fn record_failure(
        &mut self,
        date: NaiveDate,
        at: DateTime<Utc>,
        error: impl Into<String>,
        max_attempts: u32,
    ) -> ManifestStatus {
        let entry = self.entries.entry(date).or_insert_with(ManifestEntry::pending);
        if entry.status == ManifestStatus::Committed {
            return entry.status;
        }
        entry.attempt_count += 1;
        entry.last_attempt_at = Some(at);
        entry.last_error = Some(error.into());
        if entry.attempt_count >= max_attempts {
            entry.status = ManifestStatus::Failed;
        }
        entry.status
    }

    /// Move every failed entry back to pending with a fresh attempt budget.
    pub fn reset_failed(&mut self) -> Vec<NaiveDate> {
        let mut reset = Vec::new();
        for (date, entry) in self.entries.iter_mut() {
            if entry.status == ManifestStatus::Failed {
                entry.status = ManifestStatus::Pending;
                entry.attempt_count = 0;
                reset.push(*date);
            }
        }
        reset
    }

    /// Drop every entry. The only operation allowed to forget a commit.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.window_floor = None;
    }
}

/// Durable, versioned manifest storage.
///
/// Guarantees:
/// - `load` of a never-written domain returns an empty manifest at version 0.
/// - `commit` is atomic: readers observe the old or the new document, never
///   a partial one.
/// - `commit` fails with `VersionConflict` unless `manifest.version` equals
///   the stored version; on success the stored version is incremented and
///   returned.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Load the current manifest for a domain.
    async fn load(&self, domain: &Domain) -> StorageResult<Manifest>;

    /// Atomically replace the manifest, returning the new version.
    async fn commit(&self, manifest: &Manifest) -> StorageResult<u64>;

    /// Domains that have a persisted manifest.
    async fn domains(&self) -> StorageResult<Vec<Domain>>;
}

// ---------------------------------------------------------------------------
// RunRegistry: asset run state
// ---------------------------------------------------------------------------

/// Unique identifier for an asset run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an asset run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cron,
    Upstream,
    Manual,
    Retry,
}

/// One execution of an asset for a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRun {
    pub run_id: RunId,
    pub asset: AssetId,
    pub partition: PartitionKey,
    pub state: RunState,
    /// 1-based attempt number within a retry chain.
    pub attempt: u32,
    pub trigger: TriggerSource,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AssetRun {
    pub fn new_pending(
        asset: AssetId,
        partition: PartitionKey,
        trigger: TriggerSource,
        attempt: u32,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            asset,
            partition,
            state: RunState::Pending,
            attempt,
            trigger,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Result of [`RunRegistry::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new pending run was recorded.
    Created(AssetRun),
    /// A non-terminal run already exists for the pair; nothing was created.
    AlreadyActive(AssetRun),
}

impl CreateOutcome {
    pub fn run(&self) -> &AssetRun {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::AlreadyActive(r) => r,
        }
    }
}

/// Result of [`RunRegistry::start`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The run is now `running`.
    Started(AssetRun),
    /// An upstream asset has no succeeded run for the partition date.
    Blocked { upstream: AssetId },
}

/// Asset run registry.
///
/// Guarantees:
/// - At most one non-terminal run exists per `(asset, partition)`; `create`
///   checks and inserts under one lock.
/// - A run transitions: Pending → Running → Succeeded | Failed. A pending run
///   may also fail directly (cancelled before start).
/// - `start` checks the upstream gate and transitions in one step, so a run
///   is never observed running while a gated upstream is not succeeded.
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Create a pending run unless one is already active for the pair.
    async fn create(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
        trigger: TriggerSource,
        attempt: u32,
    ) -> StorageResult<CreateOutcome>;

    /// Move a pending run to running if the latest run of every `gate` asset
    /// for the same partition date (in the gate asset's own domain) has
    /// succeeded.
    async fn start(&self, run_id: &RunId, gate: &[AssetId]) -> StorageResult<StartOutcome>;

    /// Record a terminal state (`Succeeded` or `Failed`).
    async fn finish(
        &self,
        run_id: &RunId,
        state: RunState,
        error: Option<String>,
    ) -> StorageResult<AssetRun>;

    /// Fetch a run by id.
    async fn get(&self, run_id: &RunId) -> StorageResult<AssetRun>;

    /// Most recently created run for the pair, if any.
    async fn latest(
        &self,
        asset: &AssetId,
        partition: &PartitionKey,
    ) -> StorageResult<Option<AssetRun>>;

    /// All runs, optionally for one asset, newest first.
    async fn list(&self, asset: Option<&AssetId>) -> StorageResult<Vec<AssetRun>>;

    /// Fail every pending or running run with `reason`.
    ///
    /// Called once at startup, before any trigger: a run left non-terminal by
    /// a previous process would otherwise hold its pair active forever.
    async fn fail_interrupted(&self, reason: &str) -> StorageResult<Vec<AssetRun>>;
}

/// Validate a `finish` transition; shared by every registry backend.
pub fn check_finish(run: &AssetRun, state: RunState) -> StorageResult<()> {
    if !state.is_terminal() {
        return Err(StorageError::InvalidRunState {
            run_id: run.run_id.0.clone(),
            status: state.to_string(),
            expected: "succeeded or failed".to_string(),
        });
    }
    match (run.state, state) {
        (RunState::Running, _) | (RunState::Pending, RunState::Failed) => Ok(()),
        (current, _) => Err(StorageError::InvalidRunState {
            run_id: run.run_id.0.clone(),
            status: current.to_string(),
            expected: if state == RunState::Succeeded {
                "running".to_string()
            } else {
                "pending or running".to_string()
            },
        }),
    }
}

// ---------------------------------------------------------------------------
// TableStore: transactional tables
// ---------------------------------------------------------------------------

/// A materialized record keyed by `(key, partition)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    /// Natural (business) key.
    pub key: String,
    pub partition: NaiveDate,
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Outcome of a partition merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub table: TableId,
    pub partition: NaiveDate,
    /// Table version after the merge.
    pub version: u64,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// `false` when the batch changed nothing and no version was written.
    pub committed: bool,
}

/// Point-in-time view of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table: TableId,
    pub version: u64,
    /// Sorted by `(partition, key)`.
    pub rows: Vec<TableRow>,
}

impl TableSnapshot {
    /// SHA-256 over the canonical JSON of the row set.
    ///
    /// Two snapshots with equal digests hold byte-identical rows.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for row in &self.rows {
            // BTreeMap-backed rows serialize deterministically.
            if let Ok(bytes) = serde_json::to_vec(row) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Result of compacting a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactReport {
    pub table: TableId,
    pub files_before: usize,
    pub files_after: usize,
    /// New version, or `None` when nothing needed compaction.
    pub version: Option<u64>,
}

/// Result of expiring old versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireReport {
    pub table: TableId,
    pub versions_removed: usize,
    pub files_removed: usize,
}

/// Transactional table store.
///
/// Guarantees:
/// - `merge_partition` is an upsert on `(key, partition)`: matching rows are
///   replaced, new rows inserted, nothing is deleted. It commits atomically
///   or not at all, and writes no version when the batch changes nothing.
/// - `snapshot` reads one committed version; concurrent commits, compaction
///   and expiry never expose partial state to it.
/// - `compact` never changes the logical row set.
/// - `expire_versions` always keeps the latest version.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Upsert `rows` into one partition of `table`.
    async fn merge_partition(
        &self,
        table: &TableId,
        partition: NaiveDate,
        rows: Vec<TableRow>,
    ) -> StorageResult<MergeReport>;

    /// Read the latest version, optionally restricted to one partition.
    async fn snapshot(
        &self,
        table: &TableId,
        partition: Option<NaiveDate>,
    ) -> StorageResult<TableSnapshot>;

    /// Tables with at least one committed version.
    async fn list_tables(&self) -> StorageResult<Vec<TableId>>;

    /// Rewrite each partition's data files into a single file.
    async fn compact(&self, table: &TableId) -> StorageResult<CompactReport>;

    /// Remove versions committed before `older_than` and the files only they
    /// reference.
    async fn expire_versions(
        &self,
        table: &TableId,
        older_than: DateTime<Utc>,
    ) -> StorageResult<ExpireReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn domain_rejects_path_like_names() {
        assert!(Domain::new("screen_time").is_ok());
        assert!(Domain::new("").is_err());
        assert!(Domain::new("../etc").is_err());
        assert!(Domain::new("Screen").is_err());
        assert!(Domain::new("9lives").is_err());
    }

    #[test]
    fn asset_id_parses_and_displays() {
        let id: AssetId = "silver/screen_time/app_usage".parse().unwrap();
        assert_eq!(id.layer, Layer::Silver);
        assert_eq!(id.domain.as_str(), "screen_time");
        assert_eq!(id.to_string(), "silver/screen_time/app_usage");
        assert!("silver/screen_time".parse::<AssetId>().is_err());
        assert!("platinum/screen_time/x".parse::<AssetId>().is_err());
        assert!("gold/a/b/c".parse::<AssetId>().is_err());
    }

    #[test]
    fn partition_keys_order_by_domain_then_date() {
        let a = Domain::new("a").unwrap();
        let b = Domain::new("b").unwrap();
        let k1 = PartitionKey::new(a.clone(), d("2024-03-02"));
        let k2 = PartitionKey::new(b, d("2024-03-01"));
        let k3 = PartitionKey::new(a, d("2024-03-01"));
        let mut keys = vec![k1.clone(), k2.clone(), k3.clone()];
        keys.sort();
        assert_eq!(keys, vec![k3, k1, k2]);
    }

    #[test]
    fn failure_never_downgrades_committed() {
        let mut m = Manifest::empty(Domain::new("x").unwrap());
        let now = Utc::now();
        m.mark_committed(d("2024-01-01"), now);
        let status = m.record_failure(d("2024-01-01"), now, "boom", 1);
        assert_eq!(status, ManifestStatus::Committed);
        assert_eq!(m.entries[&d("2024-01-01")].last_error, None);
    }

    #[test]
    fn failure_moves_to_failed_at_threshold() {
        let mut m = Manifest::empty(Domain::new("x").unwrap());
        let now = Utc::now();
        assert_eq!(
            m.record_failure(d("2024-01-02"), now, "e1", 2),
            ManifestStatus::Pending
        );
        assert_eq!(
            m.record_failure(d("2024-01-02"), now, "e2", 2),
            ManifestStatus::Failed
        );
        let entry = &m.entries[&d("2024-01-02")];
        assert_eq!(entry.attempt_count, 2);
        assert_eq!(entry.last_error.as_deref(), Some("e2"));

        assert_eq!(m.reset_failed(), vec![d("2024-01-02")]);
        assert_eq!(m.status(d("2024-01-02")), Some(ManifestStatus::Pending));
        assert_eq!(m.entries[&d("2024-01-02")].attempt_count, 0);
    }

    #[test]
    fn finish_rules() {
        let asset: AssetId = "bronze/x/raw".parse().unwrap();
        let key = PartitionKey::new(Domain::new("x").unwrap(), d("2024-01-01"));
        let mut run = AssetRun::new_pending(asset, key, TriggerSource::Manual, 1);
        assert!(check_finish(&run, RunState::Succeeded).is_err());
        assert!(check_finish(&run, RunState::Failed).is_ok());
        run.state = RunState::Running;
        assert!(check_finish(&run, RunState::Succeeded).is_ok());
        assert!(check_finish(&run, RunState::Running).is_err());
        run.state = RunState::Succeeded;
        assert!(check_finish(&run, RunState::Failed).is_err());
    }
}
