//! Tracing capability handed to the orchestrator.
//!
//! The orchestrator reports a root span per run and one span per step. What
//! happens to those records is up to the Tracer: the default drops them, the
//! journal tracer appends them to a JSONL file per run.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A span boundary reported by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Unique identifier for this record
    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    pub run_id: String,

    /// Run root span or step span
    pub kind: SpanKind,

    /// Run id for run spans, step name for step spans
    pub name: String,

    pub status: SpanStatus,

    /// Accrued cost at this point in the run
    pub total_cost: f64,

    /// Metered units consumed at this point in the run
    pub total_units: u64,

    /// Time spent in the span (for finished spans)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpanRecord {
    pub fn new(
        run_id: impl Into<String>,
        kind: SpanKind,
        name: impl Into<String>,
        status: SpanStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: run_id.into(),
            kind,
            name: name.into(),
            status,
            total_cost: 0.0,
            total_units: 0,
            duration_ms: None,
            error: None,
        }
    }

    /// Attach usage totals
    pub fn with_usage(mut self, total_cost: f64, total_units: u64) -> Self {
        self.total_cost = total_cost;
        self.total_units = total_units;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Run,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// Span opened
    Started,

    /// Finished normally
    Ok,

    /// Skipped because an earlier run already completed it
    Skipped,

    /// Halted by the budget ceiling
    BudgetExceeded,

    /// Halted by a fatal error
    Failed,

    /// Halted by a deadline
    TimedOut,
}

/// Receives span records from the orchestrator.
///
/// Called inline on the run's task; implementations should return quickly.
pub trait Tracer: Send + Sync {
    fn record(&self, span: &SpanRecord);
}

/// Tracer that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn record(&self, _span: &SpanRecord) {}
}

/// Appends span records to `{dir}/{run_id}/trace.jsonl`.
///
/// Best-effort: write failures are logged and otherwise ignored.
///
/// Each span is a short synchronous open/append/flush on the calling task.
/// The orchestrator emits a handful of spans per step, never per fan-out
/// unit, so the blocking time is bounded by the number of steps. Wrap it in
/// a buffering tracer if spans are ever emitted on a hot path.
#[derive(Debug, Clone)]
pub struct JournalTracer {
    dir: PathBuf,
}

impl JournalTracer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default location ($JOBSCOUT_HOME/runs)
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(crate::config::runs_dir()?))
    }

    /// Path of the journal for a run
    pub fn journal_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(run_id).join("trace.jsonl")
    }

    fn append(&self, span: &SpanRecord) -> Result<()> {
        let path = self.journal_path(&span.run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create trace directory: {}", parent.display()))?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open trace journal: {}", path.display()))?;

        let json = serde_json::to_string(span).context("Failed to serialize span")?;
        writeln!(file, "{}", json).context("Failed to write span")?;
        file.flush().context("Failed to flush span")?;

        Ok(())
    }

    /// Read back every span recorded for a run, in order
    pub async fn replay(&self, run_id: &str) -> Result<Vec<SpanRecord>> {
        replay_journal(&self.journal_path(run_id)).await
    }
}

impl Tracer for JournalTracer {
    fn record(&self, span: &SpanRecord) {
        if let Err(e) = self.append(span) {
            warn!(run_id = %span.run_id, error = %e, "Failed to record span");
        }
    }
}

async fn replay_journal(path: &Path) -> Result<Vec<SpanRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read trace journal: {}", path.display()))?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| format!("Failed to parse span: {}", line))
        })
        .collect()
}
