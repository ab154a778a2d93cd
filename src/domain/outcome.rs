//! Terminal summary of a run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::FailureRecord;
use super::state::State;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step completed
    Success,

    /// Halted by the budget ceiling; accumulated state is preserved
    Partial,

    /// Halted by a fatal step error or a step timeout
    Failed,
}

impl RunStatus {
    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Partial => 2,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The object callers consume to decide how a run went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,

    pub status: RunStatus,

    /// Step that halted the run (None on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<String>,

    /// Fan-out units dispatched
    pub units_attempted: u64,

    /// Fan-out units that produced a contribution
    pub units_succeeded: u64,

    /// Metered units consumed
    pub total_units: u64,

    /// Accrued cost in USD
    pub total_cost: f64,

    /// Wall time of this invocation in milliseconds
    pub duration_ms: u64,

    /// Every failure recorded during the run
    pub failures: Vec<FailureRecord>,

    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Build an outcome from whatever state has accumulated
    pub fn from_state(state: &State, status: RunStatus, duration: Duration) -> Self {
        Self {
            run_id: state.run_id().to_string(),
            status,
            halted_at: None,
            units_attempted: state.units_attempted,
            units_succeeded: state.units_succeeded,
            total_units: state.total_units,
            total_cost: state.total_cost,
            duration_ms: duration.as_millis() as u64,
            failures: state.failures.clone(),
            finished_at: Utc::now(),
        }
    }

    /// Record the step at which the run halted
    pub fn halted_at(mut self, step: impl Into<String>) -> Self {
        self.halted_at = Some(step.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Failures that halted the run
    pub fn fatal_failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| f.is_fatal)
    }
}
