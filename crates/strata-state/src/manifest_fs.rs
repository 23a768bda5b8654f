//! File-backed [`ManifestStore`].
//!
//! Layout: `<root>/<domain>.json`, one JSON document per domain. Every commit
//! writes a temp file in `root` and atomically renames it over the old
//! document, so a crash leaves either the previous or the new manifest.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{Domain, Manifest, ManifestStore, StorageResult};

/// Manifest store rooted at a directory.
///
/// Writes are serialized in-process; the store is the single writer for
/// the domains under its root.
#[derive(Debug)]
pub struct FsManifestStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsManifestStore {
    /// Open (creating if needed) a manifest directory.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, domain: &Domain) -> PathBuf {
        self.root.join(format!("{}.json", domain.as_str()))
    }

    /// Read the stored manifest. An unreadable document is treated as empty
    /// so the next pass rebuilds it from the window.
    fn read(&self, domain: &Domain) -> StorageResult<Manifest> {
        let path = self.path_for(domain);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Manifest::empty(domain.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(m) if &m.domain == domain => Ok(m),
            Ok(m) => {
                warn!(
                    path = %path.display(),
                    found = %m.domain,
                    "manifest belongs to another domain; starting fresh"
                );
                Ok(Manifest::empty(domain.clone()))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt manifest; starting fresh");
                Ok(Manifest::empty(domain.clone()))
            }
        }
    }
}

#[async_trait]
impl ManifestStore for FsManifestStore {
    async fn load(&self, domain: &Domain) -> StorageResult<Manifest> {
        self.read(domain)
    }

    async fn commit(&self, manifest: &Manifest) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;

        let stored = self.read(&manifest.domain)?;
        if stored.version != manifest.version {
            return Err(StorageError::VersionConflict {
                resource: format!("manifest/{}", manifest.domain),
                expected: manifest.version,
                found: stored.version,
            });
        }

        let mut next = manifest.clone();
        next.version = manifest.version + 1;
        let json = serde_json::to_vec_pretty(&next)?;

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(&manifest.domain))?;

        debug!(domain = %manifest.domain, version = next.version, "manifest committed");
        Ok(next.version)
    }

    async fn domains(&self) -> StorageResult<Vec<Domain>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(domain) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Domain::new(s).ok())
            {
                out.push(domain);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn make_store() -> (tempfile::TempDir, FsManifestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsManifestStore::open(dir.path().join("manifests")).unwrap();
        (dir, store)
    }

    fn domain() -> Domain {
        Domain::new("screen_time").unwrap()
    }

    #[tokio::test]
    async fn missing_manifest_loads_empty() {
        let (_dir, store) = make_store();
        let m = store.load(&domain()).await.unwrap();
        assert_eq!(m.version, 0);
        assert!(m.entries.is_empty());
    }

    #[tokio::test]
    async fn commit_persists_and_bumps_version() {
        let (_dir, store) = make_store();
        let mut m = store.load(&domain()).await.unwrap();
        m.mark_committed(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), Utc::now());
        m.version = store.commit(&m).await.unwrap();
        assert_eq!(m.version, 1);

        let reopened = FsManifestStore::open(store.root()).unwrap();
        let loaded = reopened.load(&domain()).await.unwrap();
        assert_eq!(loaded, m);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let (_dir, store) = make_store();
        let m = store.load(&domain()).await.unwrap();
        store.commit(&m).await.unwrap();
        let err = store.commit(&m).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn corrupt_manifest_starts_fresh() {
        let (_dir, store) = make_store();
        std::fs::write(store.root().join("screen_time.json"), b"{not json").unwrap();
        let m = store.load(&domain()).await.unwrap();
        assert_eq!(m.version, 0);
        // The fresh manifest can overwrite the corrupt document.
        store.commit(&m).await.unwrap();
        assert_eq!(store.load(&domain()).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn domains_lists_committed_manifests() {
        let (_dir, store) = make_store();
        for name in ["location", "screen_time"] {
            let m = Manifest::empty(Domain::new(name).unwrap());
            store.commit(&m).await.unwrap();
        }
        std::fs::write(store.root().join("notes.txt"), b"x").unwrap();
        let names: Vec<String> = store
            .domains()
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, vec!["location", "screen_time"]);
    }
}
