//! Resumable loading: per-group count of leading statements already applied,
//! persisted as JSON next to the loaded file.
//!
//! Positions are statement counts, not batch indices, so a rerun with a
//! different batch size resumes at the same statement. The file is bound to
//! the plan's content fingerprint and removed once a load completes.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `<sql file>.checkpoint.json`
pub fn checkpoint_path(sql_file: &Path) -> PathBuf {
    let mut name = sql_file.as_os_str().to_os_string();
    name.push(".checkpoint.json");
    PathBuf::from(name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointState {
    /// Content hash of the plan the positions refer to
    fingerprint: String,
    /// Group name -> statements applied from the start of the group
    completed: BTreeMap<String, usize>,
}

/// Checkpoint file bound to one plan fingerprint.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    state: CheckpointState,
}

impl Checkpoint {
    /// Load `path` if it exists and matches `fingerprint`; otherwise start empty.
    pub async fn open(path: impl Into<PathBuf>, fingerprint: &str) -> Result<Self> {
        let path = path.into();
        let fresh = || CheckpointState {
            fingerprint: fingerprint.to_string(),
            ..Default::default()
        };
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: CheckpointState = serde_json::from_slice(&bytes)?;
                if saved.fingerprint == fingerprint {
                    let done: usize = saved.completed.values().sum();
                    info!(path = %path.display(), statements = done, "resuming from checkpoint");
                    saved
                } else {
                    warn!(
                        path = %path.display(),
                        "checkpoint belongs to a different file or destination schema, starting over"
                    );
                    fresh()
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => fresh(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Statements of `group` already applied.
    pub fn done_through(&self, group: &str) -> usize {
        self.state.completed.get(group).copied().unwrap_or(0)
    }

    /// Record that the first `through` statements of `group` are applied and
    /// persist immediately. Never moves a position backwards.
    pub async fn record(&mut self, group: &str, through: usize) -> Result<()> {
        let entry = self.state.completed.entry(group.to_string()).or_insert(0);
        if through <= *entry {
            return Ok(());
        }
        *entry = through;
        let json = serde_json::to_vec_pretty(&self.state)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Statements recorded as applied across all groups
    pub fn completed(&self) -> usize {
        self.state.completed.values().sum()
    }

    /// Remove the file after a finished load.
    pub async fn clear(self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_path() {
        assert_eq!(
            checkpoint_path(Path::new("/tmp/app.rewritten.sql")),
            PathBuf::from("/tmp/app.rewritten.sql.checkpoint.json")
        );
    }

    #[tokio::test]
    async fn test_roundtrip_and_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("load.checkpoint.json");

        let mut cp = Checkpoint::open(&path, "abc").await.unwrap();
        assert_eq!(cp.done_through("widgets"), 0);
        cp.record("widgets", 4).await.unwrap();
        cp.record("widgets", 2).await.unwrap();
        cp.record("gadgets", 1).await.unwrap();

        let cp = Checkpoint::open(&path, "abc").await.unwrap();
        assert_eq!(cp.done_through("widgets"), 4);
        assert_eq!(cp.done_through("gadgets"), 1);
        assert_eq!(cp.completed(), 5);

        cp.clear().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_starts_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");

        let mut cp = Checkpoint::open(&path, "a").await.unwrap();
        cp.record("t", 3).await.unwrap();

        let cp = Checkpoint::open(&path, "b").await.unwrap();
        assert_eq!(cp.done_through("t"), 0);
    }
}
