//! On-disk snapshot of all datasets
//!
//! The file is one JSON document:
//!
//! ```text
//! { "version": 1, "worker_name": "...", "saved_at_ms": ...,
//!   "datasets": { "<dataset-name>": { "value": ..., "timestamp_ms": ... } } }
//! ```
//!
//! It is written to `<file>.tmp`, synced and renamed over the target, so a
//! reader sees either the previous document or the new one.

use mastermind_common::{DatasetKind, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// One dataset as stored on disk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub value: Value,
    /// Time of the remote refresh that produced `value`
    pub timestamp_ms: u64,
}

/// Whole snapshot document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub saved_at_ms: u64,
    #[serde(default)]
    pub datasets: BTreeMap<String, PersistedEntry>,
}

impl PersistedSnapshot {
    pub fn new(worker_name: impl Into<String>, saved_at_ms: u64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            worker_name: worker_name.into(),
            saved_at_ms,
            datasets: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, kind: DatasetKind, entry: PersistedEntry) {
        self.datasets.insert(kind.name().to_string(), entry);
    }

    pub fn entry(&self, kind: DatasetKind) -> Option<&PersistedEntry> {
        self.datasets.get(kind.name())
    }
}

/// Reads and writes the snapshot file
#[derive(Clone, Debug)]
pub struct PersistenceStore {
    path: PathBuf,
}

impl PersistenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Atomically replace the snapshot file
    pub fn save(&self, snapshot: &PersistedSnapshot) -> Result<()> {
        let data = serde_json::to_vec(snapshot)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::persistence(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let temp_path = self.temp_path();
        let written = Self::write_synced(&temp_path, &data).and_then(|()| {
            std::fs::rename(&temp_path, &self.path)
                .map_err(|e| Error::persistence(format!("failed to rename snapshot: {}", e)))
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        debug!(
            "Saved snapshot of {} datasets to {}",
            snapshot.datasets.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::persistence(format!("failed to create snapshot file: {}", e)))?;

        let mut writer = BufWriter::new(file);
        writer
            .write_all(data)
            .map_err(|e| Error::persistence(format!("failed to write snapshot: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::persistence(format!("failed to flush snapshot: {}", e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::persistence(format!("failed to sync snapshot: {}", e)))
    }

    /// Read the snapshot file; `Ok(None)` if there is none
    pub fn load(&self) -> Result<Option<PersistedSnapshot>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let snapshot: PersistedSnapshot = serde_json::from_slice(&data).map_err(|e| {
            Error::persistence(format!("corrupt snapshot {}: {}", self.path.display(), e))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::persistence(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }
}
