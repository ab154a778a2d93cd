//! Immutable state snapshots taken after each completed step.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::state::State;

/// Separator between run id and step name in checkpoint keys
pub const KEY_SEPARATOR: &str = "--";

/// A persisted snapshot of State, tagged with the step that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,

    /// Step that had just completed when the snapshot was taken
    pub step_name: String,

    pub saved_at: DateTime<Utc>,

    /// SHA-256 of `state`, hex encoded
    pub digest: String,

    /// Serialized State document, kept verbatim so the digest is exact
    pub state: String,
}

impl Checkpoint {
    /// Snapshot a state after `step_name` completed
    pub fn capture(step_name: impl Into<String>, state: &State) -> serde_json::Result<Self> {
        let document = serde_json::to_string(state)?;
        Ok(Self {
            run_id: state.run_id().to_string(),
            step_name: step_name.into(),
            saved_at: Utc::now(),
            digest: digest(&document),
            state: document,
        })
    }

    /// Storage key: `{run_id}--{step_name}`
    pub fn key(&self) -> String {
        checkpoint_key(&self.run_id, &self.step_name)
    }

    /// Check the snapshot against its digest
    pub fn verify(&self) -> bool {
        digest(&self.state) == self.digest
    }

    /// Deserialize the snapshot back into a State
    pub fn restore(&self) -> serde_json::Result<State> {
        serde_json::from_str(&self.state)
    }
}

/// Summary of a stored checkpoint (for listings)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub run_id: String,
    pub step_name: String,
    pub saved_at: DateTime<Utc>,
    /// Where the checkpoint lives (file path or database key)
    pub location: CheckpointLocation,
}

/// Where a checkpoint was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend", content = "at")]
pub enum CheckpointLocation {
    File(PathBuf),
    Sqlite(String),
}

impl std::fmt::Display for CheckpointLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointLocation::File(path) => write!(f, "{}", path.display()),
            CheckpointLocation::Sqlite(key) => write!(f, "sqlite:{}", key),
        }
    }
}

/// Build a checkpoint key from its parts
pub fn checkpoint_key(run_id: &str, step_name: &str) -> String {
    format!("{}{}{}", run_id, KEY_SEPARATOR, step_name)
}

/// Check that a run id or step name can be used inside a key.
///
/// Parts may not start or end with `-`, otherwise `a-` + `b` and `a` + `-b`
/// would produce the same key.
pub fn is_valid_key_part(part: &str) -> bool {
    !part.is_empty()
        && !part.contains(KEY_SEPARATOR)
        && !part.starts_with('-')
        && !part.ends_with('-')
        && !part.contains(['/', '\\'])
        && part != "."
        && part != ".."
}

fn digest(document: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    hex::encode(hasher.finalize())
}
