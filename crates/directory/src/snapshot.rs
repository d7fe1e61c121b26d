//! Local snapshot fallback
//!
//! Every successful directory load is mirrored to a local JSON file so the
//! service can come up with its last-known extension set when the database
//! is unreachable at startup. File shape: `{"ramais": [<records>]}`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::ExtensionRecord;
use crate::DirectoryError;

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    ramais: Vec<ExtensionRecord>,
}

/// Read/write access to the snapshot file
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist the current extension set. Written via a temp file and a
    /// rename so a crash cannot leave a half-written snapshot.
    pub async fn save(&self, records: &[ExtensionRecord]) -> Result<(), DirectoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec_pretty(&SnapshotFile {
            ramais: records.to_vec(),
        })
        .map_err(|e| DirectoryError::Malformed(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(count = records.len(), path = %self.path.display(), "snapshot saved");
        Ok(())
    }

    /// Load the last-known extension set
    pub async fn load(&self) -> Result<Vec<ExtensionRecord>, DirectoryError> {
        let body = tokio::fs::read(&self.path).await?;
        let file: SnapshotFile =
            serde_json::from_slice(&body).map_err(|e| DirectoryError::Malformed(e.to_string()))?;
        Ok(file.ramais)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, port: u16) -> ExtensionRecord {
        ExtensionRecord {
            id,
            ia_number: "1000".into(),
            return_number: "1001".into(),
            bind_ip: "0.0.0.0".into(),
            ia_port: port,
            return_port: port + 1,
            building_id: 0,
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("ramais_config.json"));

        let records = vec![record(1, 8080), record(2, 9000)];
        store.save(&records).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("data/nested/ramais_config.json"));
        store.save(&[record(1, 8080)]).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.is_err());
    }
}
