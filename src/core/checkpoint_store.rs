//! Durable checkpoint persistence.
//!
//! Checkpoints are keyed `{run_id}--{step_name}` so that every step of a run
//! has its own record and all of them can be found by run id. The latest
//! checkpoint is chosen by save time (file modification time for the file
//! backend), not by the declared step order. Rewriting an older checkpoint
//! therefore changes which one a resume picks up.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use thiserror::Error;
use tracing::debug;

use crate::domain::checkpoint::{is_valid_key_part, KEY_SEPARATOR};
use crate::domain::{Checkpoint, CheckpointInfo, CheckpointLocation};

/// Errors raised by checkpoint persistence
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid checkpoint key component: {0:?}")]
    InvalidKey(String),

    #[error("Checkpoint {key} failed digest verification")]
    Corrupt { key: String },

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Checkpoint task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CheckpointError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Storage backend for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Backend name (for logs)
    fn backend(&self) -> &str;

    /// Durably write a checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointLocation, CheckpointError>;

    /// The most recently saved checkpoint for a run
    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// All checkpoints for a run, oldest first
    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, CheckpointError>;

    /// Remove every checkpoint for a run, returning how many were removed
    async fn clear(&self, run_id: &str) -> Result<usize, CheckpointError>;
}

/// Reject keys that would escape the store or collide across runs
pub(crate) fn validate_key(run_id: &str, step_name: &str) -> Result<(), CheckpointError> {
    for part in [run_id, step_name] {
        if !is_valid_key_part(part) {
            return Err(CheckpointError::InvalidKey(part.to_string()));
        }
    }
    Ok(())
}

/// Checkpoints stored as `{dir}/{run_id}--{step_name}.json`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for a step
    pub fn path_for(&self, run_id: &str, step_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}.json", run_id, KEY_SEPARATOR, step_name))
    }

    /// Checkpoint files for a run with their modification times
    fn candidates(dir: &Path, run_id: &str) -> Result<Vec<(PathBuf, SystemTime)>, CheckpointError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/{}{}*.json",
            Pattern::escape(&dir.to_string_lossy()),
            Pattern::escape(run_id),
            KEY_SEPARATOR
        );

        let mut found = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| {
                let path = e.path().to_path_buf();
                CheckpointError::io(path, std::io::Error::from(e))
            })?;
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(|e| CheckpointError::io(&path, e))?;
            found.push((path, modified));
        }

        Ok(found)
    }

    fn read_checkpoint(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = std::fs::read_to_string(path).map_err(|e| CheckpointError::io(path, e))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        if !checkpoint.verify() {
            return Err(CheckpointError::Corrupt {
                key: checkpoint.key(),
            });
        }
        Ok(checkpoint)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn backend(&self) -> &str {
        "file"
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointLocation, CheckpointError> {
        validate_key(&checkpoint.run_id, &checkpoint.step_name)?;

        let dir = self.dir.clone();
        let path = self.path_for(&checkpoint.run_id, &checkpoint.step_name);
        let content = serde_json::to_vec_pretty(checkpoint)?;

        // Write to a temp file in the same directory, then rename into place
        let written = tokio::task::spawn_blocking(move || -> Result<PathBuf, CheckpointError> {
            std::fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;

            let mut temp = tempfile::NamedTempFile::new_in(&dir)
                .map_err(|e| CheckpointError::io(&dir, e))?;
            temp.write_all(&content)
                .and_then(|_| temp.as_file().sync_all())
                .map_err(|e| CheckpointError::io(temp.path(), e))?;
            temp.persist(&path)
                .map_err(|e| CheckpointError::io(&path, e.error))?;

            Ok(path)
        })
        .await??;

        debug!(path = %written.display(), "Checkpoint written");
        Ok(CheckpointLocation::File(written))
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let dir = self.dir.clone();
        let run_id = run_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<Checkpoint>, CheckpointError> {
            let candidates = Self::candidates(&dir, &run_id)?;

            // Ties keep the later path in glob (alphabetical) order
            let latest = candidates
                .into_iter()
                .max_by_key(|(_, modified)| *modified);

            match latest {
                Some((path, _)) => Self::read_checkpoint(&path).map(Some),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let dir = self.dir.clone();
        let run_id = run_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<CheckpointInfo>, CheckpointError> {
            let mut candidates = Self::candidates(&dir, &run_id)?;
            candidates.sort_by_key(|(_, modified)| *modified);

            let prefix = format!("{}{}", run_id, KEY_SEPARATOR);
            let infos = candidates
                .into_iter()
                .filter_map(|(path, modified)| {
                    let stem = path.file_stem()?.to_str()?;
                    let step_name = stem.strip_prefix(&prefix)?.to_string();
                    Some(CheckpointInfo {
                        run_id: run_id.clone(),
                        step_name,
                        saved_at: DateTime::<Utc>::from(modified),
                        location: CheckpointLocation::File(path),
                    })
                })
                .collect();

            Ok(infos)
        })
        .await?
    }

    async fn clear(&self, run_id: &str) -> Result<usize, CheckpointError> {
        let dir = self.dir.clone();
        let run_id = run_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<usize, CheckpointError> {
            let candidates = Self::candidates(&dir, &run_id)?;
            let removed = candidates.len();
            for (path, _) in candidates {
                std::fs::remove_file(&path).map_err(|e| CheckpointError::io(&path, e))?;
            }
            Ok(removed)
        })
        .await?
    }
}
