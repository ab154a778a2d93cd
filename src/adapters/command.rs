//! Subprocess-backed pipeline steps.
//!
//! A command step spawns its program, writes a JSON request to stdin and
//! reads a JSON response from stdout:
//!
//! ```text
//! stdin:  {"run_id": "...", "step": "score", "inputs": {...}, "outputs": {...}}
//! stdout: {"output": ..., "usage": [...], "failures": [...],
//!          "units": {"attempted": 5, "succeeded": 4}, "fatal": null}
//! ```
//!
//! `units` is optional. Steps that fan out over targets report how many
//! they dispatched and how many contributed, and the counts are added to
//! the run totals even when the step also reports `fatal`.
//!
//! Every usage entry is charged to the run through the call governor before
//! the output is stored, so an invocation that tips the budget halts the
//! run without populating its output slot.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::governor::{CallGovernor, Usage};
use crate::core::pipeline::StepSpec;
use crate::core::registry::{Step, StepError};
use crate::domain::{FailureKind, FailureRecord, State};

/// Request written to the step program's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: String,
    pub step: String,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, Value>,
}

impl StepRequest {
    pub fn from_state(step: &str, state: &State) -> Self {
        Self {
            run_id: state.run_id().to_string(),
            step: step.to_string(),
            inputs: state.config.inputs.clone(),
            outputs: state.outputs.clone(),
        }
    }
}

/// Response read from the step program's stdout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResponse {
    /// Value stored in the step's output slot
    #[serde(default)]
    pub output: Value,

    /// Metered calls made by the program
    #[serde(default)]
    pub usage: Vec<Usage>,

    /// Recoverable problems to append to the run
    #[serde(default)]
    pub failures: Vec<ReportedFailure>,

    /// Fan-out units the program dispatched
    #[serde(default)]
    pub units: Option<UnitCounts>,

    /// Set when the program judged its result unusable
    #[serde(default)]
    pub fatal: Option<String>,
}

/// Sub-unit counts reported by a fan-out step program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    #[serde(default)]
    pub attempted: u64,

    #[serde(default)]
    pub succeeded: u64,
}

/// A recoverable failure reported by a step program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedFailure {
    #[serde(default = "default_failure_kind")]
    pub kind: FailureKind,

    pub message: String,

    #[serde(default)]
    pub target: Option<String>,
}

fn default_failure_kind() -> FailureKind {
    FailureKind::Other
}

impl ReportedFailure {
    fn into_record(self, origin: &str) -> FailureRecord {
        let record = FailureRecord::new(origin, self.kind, self.message);
        match self.target {
            Some(target) => record.with_target(target),
            None => record,
        }
    }
}

/// Pipeline step that runs an external program
pub struct CommandStep {
    spec: StepSpec,
    governor: Arc<CallGovernor>,
}

impl CommandStep {
    pub fn new(spec: StepSpec, governor: Arc<CallGovernor>) -> Self {
        Self { spec, governor }
    }

    pub fn spec(&self) -> &StepSpec {
        &self.spec
    }

    /// Run the program once and parse its response
    async fn invoke(&self, request: &[u8]) -> Result<StepResponse> {
        let name = &self.spec.name;

        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!("Failed to spawn '{}' for step '{}'", self.spec.command, name)
            })?;

        let mut stdin = child
            .stdin
            .take()
            .with_context(|| format!("No stdin for step '{}'", name))?;

        // Feed stdin while draining stdout so large documents cannot deadlock
        let writer = async move {
            stdin.write_all(request).await?;
            stdin.shutdown().await
        };
        let (_, output) = tokio::try_join!(writer, child.wait_with_output())
            .with_context(|| format!("Failed to communicate with step '{}'", name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Step '{}' failed with exit code {}: {}",
                name,
                exit_code,
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Step '{}' wrote an invalid response", name))
    }
}

#[async_trait]
impl Step for CommandStep {
    async fn run(&self, state: &mut State) -> Result<(), StepError> {
        let name = self.spec.name.as_str();
        let request = serde_json::to_vec(&StepRequest::from_state(name, state))
            .context("Failed to serialize step request")?;

        let response = self
            .spec
            .retry_policy
            .retry(|attempt| {
                debug!(step = name, attempt, "Invoking step program");
                self.invoke(&request)
            })
            .await?;

        for usage in &response.usage {
            self.governor.record(usage, state)?;
        }

        for failure in response.failures {
            warn!(step = name, kind = %failure.kind, "{}", failure.message);
            state.record_failure(failure.into_record(name));
        }

        if let Some(units) = response.units {
            if units.succeeded > units.attempted {
                warn!(
                    step = name,
                    attempted = units.attempted,
                    succeeded = units.succeeded,
                    "Step reported more successes than attempts"
                );
            }
            // Succeeded never exceeds attempted in the run totals
            state.record_units(units.attempted, units.succeeded.min(units.attempted));
        }

        if let Some(message) = response.fatal {
            return Err(StepError::Fatal(message));
        }

        state.set_output(name, response.output);
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout()
    }
}
