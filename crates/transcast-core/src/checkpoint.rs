//! Agent-local checkpoint store.
//!
//! A single-record JSON file recording the task currently in flight on one
//! agent process, used purely to detect a crash on the next startup.
//! Writes go to a sibling temp file in the same directory and are
//! atomically renamed over the target so a crash mid-write never leaves a
//! torn file; reads tolerate a missing or malformed file as "no checkpoint".

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The agent-local record of one in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub task_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub progress: f64,
    pub owner_process_id: u32,
}

/// Owns the checkpoint file at `<state_dir>/task_checkpoint.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("task_checkpoint.json"),
        }
    }

    /// Read the checkpoint, if any. A missing or malformed file is treated
    /// identically to "no checkpoint" -- a parse failure is logged, never
    /// propagated as a startup error.
    pub fn load(&self) -> Option<Checkpoint> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read checkpoint file");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint file is malformed, treating as absent");
                None
            }
        }
    }

    /// Write (or overwrite) the checkpoint via a same-directory temp file
    /// and atomic rename.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("checkpoint path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;

        let tmp_path = dir.join(format!(".task_checkpoint.json.{}.tmp", std::process::id()));
        let contents = serde_json::to_string_pretty(checkpoint).context("failed to serialize checkpoint")?;
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("failed to write checkpoint temp file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename checkpoint into place at {}", self.path.display()))?;
        Ok(())
    }

    /// Delete the checkpoint. Safe to call when no checkpoint exists.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove checkpoint at {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Checkpoint {
        Checkpoint {
            task_id: uuid::Uuid::new_v4(),
            started_at: Utc::now(),
            progress: 42.5,
            owner_process_id: std::process::id(),
        }
    }

    #[test]
    fn load_returns_none_when_absent() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = sample();

        store.save(&checkpoint).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample()).unwrap();

        store.clear().unwrap();
        assert!(store.load().is_none());

        // Clearing an already-absent checkpoint is not an error.
        store.clear().unwrap();
    }

    #[test]
    fn malformed_file_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(dir.path().join("task_checkpoint.json"), b"not json").unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn save_overwrites_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample()).unwrap();

        let second = sample();
        store.save(&second).unwrap();
        assert_eq!(store.load().unwrap(), second);
    }
}
