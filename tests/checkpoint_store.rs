//! Checkpoint Store Integration Tests
//!
//! Tests for latest-checkpoint selection across both backends.

use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use serde_json::json;
use tempfile::TempDir;

use jobscout::core::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore};
use jobscout::domain::{Checkpoint, CheckpointLocation, RunConfig, State};

fn checkpoint_after(run_id: &str, steps: &[&str]) -> Checkpoint {
    let mut state = State::new(RunConfig::new(run_id));
    for step in steps {
        state.set_output(*step, json!({ "step": step }));
        state.mark_completed(*step);
    }
    let last = steps.last().copied().unwrap_or("none");
    Checkpoint::capture(last, &state).unwrap()
}

fn set_age(path: &std::path::Path, seconds_ago: u64) {
    let time = SystemTime::now() - Duration::from_secs(seconds_ago);
    set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
}

#[tokio::test]
async fn test_latest_is_chosen_by_modification_time() {
    let temp = TempDir::new().unwrap();
    let store = FileCheckpointStore::new(temp.path());

    store.save(&checkpoint_after("run-1", &["a"])).await.unwrap();
    store.save(&checkpoint_after("run-1", &["a", "b"])).await.unwrap();
    store.save(&checkpoint_after("run-1", &["a", "b", "c"])).await.unwrap();

    set_age(&store.path_for("run-1", "a"), 300);
    set_age(&store.path_for("run-1", "b"), 200);
    set_age(&store.path_for("run-1", "c"), 100);

    let latest = store.load_latest("run-1").await.unwrap().unwrap();
    assert_eq!(latest.step_name, "c");

    // Rewriting a's checkpoint makes it the newest, regardless of step order
    set_age(&store.path_for("run-1", "a"), 10);

    let latest = store.load_latest("run-1").await.unwrap().unwrap();
    assert_eq!(latest.step_name, "a");
    assert_eq!(latest.restore().unwrap().last_completed(), Some("a"));
}

#[tokio::test]
async fn test_list_is_sorted_oldest_first() {
    let temp = TempDir::new().unwrap();
    let store = FileCheckpointStore::new(temp.path());

    store.save(&checkpoint_after("run-1", &["a"])).await.unwrap();
    store.save(&checkpoint_after("run-1", &["a", "b"])).await.unwrap();

    set_age(&store.path_for("run-1", "a"), 10);
    set_age(&store.path_for("run-1", "b"), 60);

    let listed = store.list("run-1").await.unwrap();
    let steps: Vec<_> = listed.iter().map(|c| c.step_name.as_str()).collect();
    assert_eq!(steps, vec!["b", "a"]);
    assert!(listed[0].saved_at < listed[1].saved_at);
    assert_eq!(
        listed[0].location,
        CheckpointLocation::File(store.path_for("run-1", "b"))
    );
}

#[tokio::test]
async fn test_unrelated_files_are_ignored() {
    let temp = TempDir::new().unwrap();
    let store = FileCheckpointStore::new(temp.path());

    store.save(&checkpoint_after("run-1", &["a"])).await.unwrap();
    std::fs::write(temp.path().join("run-1--notes.txt"), "not a checkpoint").unwrap();
    std::fs::write(temp.path().join("run-10--a.json"), "{}").unwrap();

    let latest = store.load_latest("run-1").await.unwrap().unwrap();
    assert_eq!(latest.step_name, "a");
    assert_eq!(store.list("run-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_clear_then_fresh_start() {
    let temp = TempDir::new().unwrap();
    let store = FileCheckpointStore::new(temp.path());

    store.save(&checkpoint_after("run-1", &["a"])).await.unwrap();
    store.save(&checkpoint_after("run-1", &["a", "b"])).await.unwrap();

    assert_eq!(store.clear("run-1").await.unwrap(), 2);
    assert!(store.load_latest("run-1").await.unwrap().is_none());
    assert_eq!(store.clear("run-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_sqlite_latest_follows_save_time() {
    let temp = TempDir::new().unwrap();
    let store = SqliteCheckpointStore::open(&temp.path().join("checkpoints.db")).unwrap();

    let mut a = checkpoint_after("run-1", &["a"]);
    let mut b = checkpoint_after("run-1", &["a", "b"]);
    let base = a.saved_at;
    b.saved_at = base + chrono::Duration::seconds(1);

    store.save(&a).await.unwrap();
    store.save(&b).await.unwrap();
    assert_eq!(store.load_latest("run-1").await.unwrap().unwrap().step_name, "b");

    // Re-saving a with a later timestamp makes it the latest
    a.saved_at = base + chrono::Duration::seconds(2);
    store.save(&a).await.unwrap();

    let latest = store.load_latest("run-1").await.unwrap().unwrap();
    assert_eq!(latest.step_name, "a");
    assert_eq!(store.list("run-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("checkpoints.db");

    {
        let store = SqliteCheckpointStore::open(&path).unwrap();
        store.save(&checkpoint_after("run-1", &["a"])).await.unwrap();
    }

    let reopened = SqliteCheckpointStore::open(&path).unwrap();
    let latest = reopened.load_latest("run-1").await.unwrap().unwrap();
    assert_eq!(latest.step_name, "a");
    assert!(latest.verify());
}
