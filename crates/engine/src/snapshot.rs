//! Graph snapshots: the fingerprints of the last completed run.
//!
//! The engine only needs `load`/`save`; where snapshots live is up to the
//! host. Two stores ship with the crate: an in-memory map and a directory of
//! JSON files.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::SnapshotError;

/// Persisted record of a completed run.
///
/// Wire format: `{ "graphHash": "...", "nodeFingerprints": { "<id>": "<fp>" } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub graph_hash: String,
    pub node_fingerprints: BTreeMap<String, String>,
}

impl GraphSnapshot {
    pub fn new(graph_hash: impl Into<String>, node_fingerprints: BTreeMap<String, String>) -> Self {
        Self {
            graph_hash: graph_hash.into(),
            node_fingerprints,
        }
    }

    pub fn fingerprint(&self, node_id: &str) -> Option<&str> {
        self.node_fingerprints.get(node_id).map(String::as_str)
    }
}

/// Load/save contract for snapshots, keyed by graph id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when no snapshot has been saved for `graph_id` yet.
    async fn load(&self, graph_id: &str) -> Result<Option<GraphSnapshot>, SnapshotError>;

    /// Replace the stored snapshot for `graph_id`.
    async fn save(&self, graph_id: &str, snapshot: &GraphSnapshot) -> Result<(), SnapshotError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store; snapshots are lost when it is dropped.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<String, GraphSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, GraphSnapshot>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, graph_id: &str) -> Result<Option<GraphSnapshot>, SnapshotError> {
        Ok(self.lock().get(graph_id).cloned())
    }

    async fn save(&self, graph_id: &str, snapshot: &GraphSnapshot) -> Result<(), SnapshotError> {
        self.lock().insert(graph_id.to_owned(), snapshot.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// One `<graph_id>.json` file per graph inside `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    dir: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `graph_id`. Characters outside
    /// `[A-Za-z0-9._-]` are replaced so ids cannot escape the directory.
    pub fn path_for(&self, graph_id: &str) -> PathBuf {
        let safe: String = graph_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = if safe.is_empty() || safe.chars().all(|c| c == '.') {
            format!("_{safe}")
        } else {
            safe
        };
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self, graph_id: &str) -> Result<Option<GraphSnapshot>, SnapshotError> {
        let path = self.path_for(graph_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "loaded snapshot");
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, graph_id: &str, snapshot: &GraphSnapshot) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(graph_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        // Write-then-rename so readers never see a half-written file.
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), nodes = snapshot.node_fingerprints.len(), "saved snapshot");
        Ok(())
    }
}
