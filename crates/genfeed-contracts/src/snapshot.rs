use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::events::now_utc_iso;
use crate::requests::GenerationRequest;

pub const SNAPSHOT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub schema_version: u64,
    pub saved_at: String,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub requests: Vec<GenerationRequest>,
}

/// JSON file holding the last known request list, used to warm the feed on start.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable snapshots load as `None`; a stale cache is never fatal.
    pub fn load(&self) -> Option<FeedSnapshot> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let snapshot: FeedSnapshot = serde_json::from_str(&raw).ok()?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return None;
        }
        Some(snapshot)
    }

    pub fn save(
        &self,
        requests: &[GenerationRequest],
        next_cursor: Option<&str>,
    ) -> anyhow::Result<FeedSnapshot> {
        let snapshot = FeedSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            saved_at: now_utc_iso(),
            next_cursor: next_cursor.map(str::to_string),
            requests: requests.to_vec(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("failed to write snapshot {}", self.path.display()))?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use crate::requests::{GeneratedImage, GenerationRequest, RequestStatus};

    use super::{SnapshotStore, SNAPSHOT_SCHEMA_VERSION};

    #[test]
    fn snapshot_save_then_load_restores_requests() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SnapshotStore::new(temp.path().join("state").join("feed.json"));
        let requests = vec![GenerationRequest::new(
            3,
            RequestStatus::Processing,
            vec![GeneratedImage::new(Some(8), "h8")],
        )];

        store.save(&requests, Some("c-2"))?;
        let loaded = store.load();
        let loaded = loaded.ok_or_else(|| anyhow::anyhow!("snapshot missing"))?;
        assert_eq!(loaded.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(loaded.requests, requests);
        assert_eq!(loaded.next_cursor.as_deref(), Some("c-2"));
        Ok(())
    }

    #[test]
    fn missing_or_foreign_snapshot_loads_as_none() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("feed.json");
        let store = SnapshotStore::new(&path);
        assert!(store.load().is_none());

        std::fs::write(&path, r#"{"schema_version": 99, "saved_at": "x"}"#)?;
        assert!(store.load().is_none());

        std::fs::write(&path, "not json")?;
        assert!(store.load().is_none());
        Ok(())
    }
}
