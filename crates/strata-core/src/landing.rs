//! Landing storage: raw partition payloads waiting for the bronze layer.
//!
//! Layout: `<root>/<domain>/<YYYY_MM_DD>/*.json`. Every file is one JSON
//! document; writers replace files atomically, readers skip any file that
//! does not parse.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_state::PartitionKey;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::METRICS;

/// Identity of the device that produced a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
}

/// The document an ingestion sink accepts for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    pub domain: String,
    pub partition_date: NaiveDate,
    #[serde(flatten)]
    pub device: DeviceInfo,
    pub updated_at: DateTime<Utc>,
    pub data: Vec<Value>,
}

impl IngestPayload {
    pub fn new(key: &PartitionKey, device: &DeviceInfo, data: Vec<Value>) -> Self {
        Self {
            domain: key.domain.to_string(),
            partition_date: key.date,
            device: device.clone(),
            updated_at: Utc::now(),
            data,
        }
    }
}

/// A parsed landing file.
#[derive(Debug, Clone)]
pub struct LandedDocument {
    pub file: PathBuf,
    pub value: Value,
}

/// Filesystem landing area.
#[derive(Debug, Clone)]
pub struct FsLandingStore {
    root: PathBuf,
}

impl FsLandingStore {
    /// Create a landing store rooted at `root`. Creates the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.domain.as_str()).join(key.date_segment())
    }

    /// Atomically write (or replace) `file_name` in the partition directory.
    pub fn write(&self, key: &PartitionKey, file_name: &str, value: &impl Serialize) -> Result<PathBuf> {
        let dir = self.partition_dir(key);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(value)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!(partition = %key, file = %path.display(), "landing file written");
        Ok(path)
    }

    /// Read every `*.json` document of a partition, in file-name order.
    ///
    /// Files that cannot be read or parsed are skipped with a warning. A
    /// missing partition directory yields no documents.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<LandedDocument>> {
        let dir = self.partition_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut docs = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<Value>(&b).map_err(|e| e.to_string()));
            match parsed {
                Ok(value) => docs.push(LandedDocument { file: path, value }),
                Err(reason) => {
                    METRICS.inc_records_skipped();
                    warn!(partition = %key, file = %path.display(), %reason, "skipping unreadable landing file");
                }
            }
        }
        Ok(docs)
    }
}
