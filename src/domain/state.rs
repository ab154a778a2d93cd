//! Run state threaded through every pipeline step.
//!
//! The State is an opaque document from the orchestrator's point of view:
//! steps read and write stage outputs, the governor updates the totals,
//! and the whole thing round-trips through JSON for checkpointing.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::failure::FailureRecord;
use super::outcome::RunOutcome;

/// Immutable configuration for a single run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run identifier (also the checkpoint key prefix)
    pub run_id: String,

    /// Name of the pipeline definition driving the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    /// Input parameters handed to the steps (e.g. resume path)
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    /// Spending ceiling and warning threshold
    #[serde(default)]
    pub budget: BudgetLimits,

    /// Deadlines and fan-out settings
    #[serde(default)]
    pub limits: RunLimits,
}

impl RunConfig {
    /// Create a config with default budget and limits
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline: None,
            inputs: BTreeMap::new(),
            budget: BudgetLimits::default(),
            limits: RunLimits::default(),
        }
    }

    /// Record which pipeline definition drives the run
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Add an input parameter
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Replace the budget limits
    pub fn with_budget(mut self, budget: BudgetLimits) -> Self {
        self.budget = budget;
        self
    }

    /// Replace the run limits
    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Per-run spending limits in USD
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Halt the run once accrued cost exceeds this (default: $5.00)
    #[serde(default = "default_hard_limit")]
    pub hard_limit_usd: f64,

    /// Warn once accrued cost exceeds this (default: $4.00)
    #[serde(default = "default_warn_limit")]
    pub warn_limit_usd: f64,
}

fn default_hard_limit() -> f64 {
    5.0
}
fn default_warn_limit() -> f64 {
    4.0
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            hard_limit_usd: default_hard_limit(),
            warn_limit_usd: default_warn_limit(),
        }
    }
}

impl BudgetLimits {
    /// Limits with the warning threshold at 80% of the ceiling
    pub fn with_ceiling(hard_limit_usd: f64) -> Self {
        Self {
            hard_limit_usd,
            warn_limit_usd: hard_limit_usd * 0.8,
        }
    }
}

/// Deadlines and concurrency settings for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    /// Per-step deadline in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Per-unit deadline inside a fan-out batch (default: 60)
    #[serde(default = "default_unit_timeout")]
    pub unit_timeout_seconds: u64,

    /// Fan-out concurrency cap (default: 5)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_step_timeout() -> u64 {
    300
}
fn default_unit_timeout() -> u64 {
    60
}
fn default_concurrency() -> usize {
    5
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
            unit_timeout_seconds: default_unit_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

impl RunLimits {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_seconds)
    }
}

/// Explicit progress cursor stored alongside the stage outputs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum Stage {
    /// No step has completed yet
    #[default]
    NotStarted,

    /// The named step was the last to complete
    Completed { step: String },
}

/// The document threaded through every step of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Run configuration (never changes after creation)
    pub config: RunConfig,

    /// Last completed step
    #[serde(default)]
    pub cursor: Stage,

    /// Stage outputs keyed by step name
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,

    /// Recorded failures, in the order they happened
    #[serde(default)]
    pub failures: Vec<FailureRecord>,

    /// Metered units consumed so far
    #[serde(default)]
    pub total_units: u64,

    /// Accrued cost in USD
    #[serde(default)]
    pub total_cost: f64,

    /// Fan-out units dispatched
    #[serde(default)]
    pub units_attempted: u64,

    /// Fan-out units that produced a contribution
    #[serde(default)]
    pub units_succeeded: u64,

    /// Whether the soft budget warning has been emitted
    #[serde(default)]
    pub budget_warned: bool,

    /// Final result, if a terminal step attached one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunOutcome>,
}

impl State {
    /// Create a fresh state for a run
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            cursor: Stage::NotStarted,
            outputs: BTreeMap::new(),
            failures: Vec::new(),
            total_units: 0,
            total_cost: 0.0,
            units_attempted: 0,
            units_succeeded: 0,
            budget_warned: false,
            result: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    /// Get the output of a step, if it has produced one
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    /// Check whether a step's output slot is populated
    pub fn has_output(&self, step: &str) -> bool {
        self.outputs.contains_key(step)
    }

    /// Populate a step's output slot
    pub fn set_output(&mut self, step: impl Into<String>, value: Value) {
        self.outputs.insert(step.into(), value);
    }

    /// Append an entry to a step's output slot, creating a list if empty.
    ///
    /// Used for fan-out aggregation, where completion order is arbitrary.
    pub fn push_output(&mut self, step: &str, value: Value) {
        match self.outputs.get_mut(step) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, value]);
            }
            None => {
                self.outputs.insert(step.to_string(), Value::Array(vec![value]));
            }
        }
    }

    /// Append a failure record
    pub fn record_failure(&mut self, failure: FailureRecord) {
        self.failures.push(failure);
    }

    /// Count fan-out units
    pub fn record_units(&mut self, attempted: u64, succeeded: u64) {
        self.units_attempted = self.units_attempted.saturating_add(attempted);
        self.units_succeeded = self.units_succeeded.saturating_add(succeeded);
    }

    /// Advance the cursor past a completed step
    pub fn mark_completed(&mut self, step: impl Into<String>) {
        self.cursor = Stage::Completed { step: step.into() };
    }

    /// Name of the last completed step, per the cursor
    pub fn last_completed(&self) -> Option<&str> {
        match &self.cursor {
            Stage::NotStarted => None,
            Stage::Completed { step } => Some(step.as_str()),
        }
    }

    /// Serialize to a flat JSON document
    pub fn to_document(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Reconstruct from a JSON document
    pub fn from_document(document: Value) -> serde_json::Result<Self> {
        serde_json::from_value(document)
    }
}
