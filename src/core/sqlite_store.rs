//! SQLite-backed checkpoint store.
//!
//! Same key convention as the file store; the `saved_at_micros` column plays
//! the role of the file modification time when choosing the latest record.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::checkpoint_store::{validate_key, CheckpointError, CheckpointStore};
use crate::domain::{Checkpoint, CheckpointInfo, CheckpointLocation};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    key             TEXT PRIMARY KEY,
    run_id          TEXT NOT NULL,
    step_name       TEXT NOT NULL,
    saved_at        TEXT NOT NULL,
    saved_at_micros INTEGER NOT NULL,
    digest          TEXT NOT NULL,
    state           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS checkpoints_run_id ON checkpoints (run_id, saved_at_micros);
";

/// Checkpoints stored in a single SQLite table
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database (tests)
    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await?
    }
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointLocation, CheckpointError> {
        validate_key(&checkpoint.run_id, &checkpoint.step_name)?;

        let checkpoint = checkpoint.clone();
        self.with_conn(move |conn| {
            let key = checkpoint.key();
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints
                    (key, run_id, step_name, saved_at, saved_at_micros, digest, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key,
                    checkpoint.run_id,
                    checkpoint.step_name,
                    checkpoint.saved_at.to_rfc3339(),
                    checkpoint.saved_at.timestamp_micros(),
                    checkpoint.digest,
                    checkpoint.state,
                ],
            )?;
            Ok(CheckpointLocation::Sqlite(key))
        })
        .await
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let checkpoint = conn
                .query_row(
                    "SELECT run_id, step_name, saved_at_micros, digest, state
                     FROM checkpoints
                     WHERE run_id = ?1
                     ORDER BY saved_at_micros DESC, rowid DESC
                     LIMIT 1",
                    params![run_id],
                    |row| {
                        Ok(Checkpoint {
                            run_id: row.get(0)?,
                            step_name: row.get(1)?,
                            saved_at: from_micros(row.get(2)?),
                            digest: row.get(3)?,
                            state: row.get(4)?,
                        })
                    },
                )
                .optional()?;

            match checkpoint {
                Some(checkpoint) if !checkpoint.verify() => Err(CheckpointError::Corrupt {
                    key: checkpoint.key(),
                }),
                other => Ok(other),
            }
        })
        .await
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, step_name, saved_at_micros
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY saved_at_micros ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![run_id], |row| {
                Ok(CheckpointInfo {
                    run_id: run_id.clone(),
                    location: CheckpointLocation::Sqlite(row.get(0)?),
                    step_name: row.get(1)?,
                    saved_at: from_micros(row.get(2)?),
                })
            })?;

            let mut infos = Vec::new();
            for info in rows {
                infos.push(info?);
            }
            Ok(infos)
        })
        .await
    }

    async fn clear(&self, run_id: &str) -> Result<usize, CheckpointError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunConfig, State};
    use chrono::Duration;

    fn checkpoint_at(run_id: &str, step: &str, saved_at: DateTime<Utc>) -> Checkpoint {
        let mut state = State::new(RunConfig::new(run_id));
        state.mark_completed(step);
        let mut checkpoint = Checkpoint::capture(step, &state).unwrap();
        checkpoint.saved_at = saved_at;
        checkpoint
    }

    #[tokio::test]
    async fn test_latest_by_saved_at() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let t0 = Utc::now();

        store.save(&checkpoint_at("run-1", "a", t0)).await.unwrap();
        store.save(&checkpoint_at("run-1", "b", t0 + Duration::seconds(1))).await.unwrap();
        store.save(&checkpoint_at("run-1", "c", t0 + Duration::seconds(2))).await.unwrap();

        let latest = store.load_latest("run-1").await.unwrap().unwrap();
        assert_eq!(latest.step_name, "c");

        // Rewriting `a` with a later timestamp makes it the latest
        store.save(&checkpoint_at("run-1", "a", t0 + Duration::seconds(3))).await.unwrap();
        let latest = store.load_latest("run-1").await.unwrap().unwrap();
        assert_eq!(latest.step_name, "a");
        assert_eq!(latest.restore().unwrap().last_completed(), Some("a"));
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let t0 = Utc::now();

        store.save(&checkpoint_at("run-1", "a", t0)).await.unwrap();
        store.save(&checkpoint_at("run-1", "b", t0 + Duration::seconds(1))).await.unwrap();
        store.save(&checkpoint_at("run-2", "a", t0)).await.unwrap();

        let listed = store.list("run-1").await.unwrap();
        let steps: Vec<_> = listed.iter().map(|i| i.step_name.as_str()).collect();
        assert_eq!(steps, vec!["a", "b"]);
        assert_eq!(listed[0].location, CheckpointLocation::Sqlite("run-1--a".to_string()));

        assert_eq!(store.clear("run-1").await.unwrap(), 2);
        assert!(store.load_latest("run-1").await.unwrap().is_none());
        assert!(store.load_latest("run-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_row_detected() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let mut checkpoint = checkpoint_at("run-1", "a", Utc::now());
        checkpoint.digest = "0".repeat(64);
        store.save(&checkpoint).await.unwrap();

        let result = store.load_latest("run-1").await;
        assert!(matches!(result, Err(CheckpointError::Corrupt { .. })));
    }
}
