//! Best-effort persistence of the canonical state across sessions.
//!
//! One JSON file per topic. Every failure mode (missing directory, corrupt
//! file, quota, permissions) degrades to a cache miss or a dropped write;
//! nothing here ever reaches the caller as an error. The cache is not
//! authoritative: the first live merge overwrites it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::state::entity::DrawEntity;

/// Per-topic JSON snapshot store under a fixed directory.
pub struct SnapshotCache {
    dir: PathBuf,
}

impl SnapshotCache {
    /// Create a cache rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the cached records for a topic, treating any failure as a miss.
    pub fn load(&self, topic: &str) -> Option<Vec<DrawEntity>> {
        let path = self.path(topic);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "snapshot cache miss");
                return None;
            }
        };
        match serde_json::from_str::<Vec<DrawEntity>>(&contents) {
            Ok(records) => {
                debug!(topic, count = records.len(), "snapshot cache hit");
                Some(records)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt snapshot; treated as miss");
                None
            }
        }
    }

    /// Persist the records for a topic, swallowing any failure.
    pub fn save(&self, topic: &str, records: &[DrawEntity]) {
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "cannot create snapshot directory");
            return;
        }
        let path = self.path(topic);
        let payload = match serde_json::to_vec(records) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic, error = %err, "failed to serialize snapshot");
                return;
            }
        };
        if let Err(err) = fs::write(&path, payload) {
            warn!(path = %path.display(), error = %err, "failed to write snapshot");
        }
    }

    fn path(&self, topic: &str) -> PathBuf {
        let safe: String = topic
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        Path::new(&self.dir).join(format!("{safe}.json"))
    }
}
