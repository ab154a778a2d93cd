//! Step interface and the ordered registry that defines pipeline topology.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use super::governor::BudgetExceeded;
use crate::domain::checkpoint::is_valid_key_part;
use crate::domain::{Stage, State};

/// Errors a step can raise to the orchestrator
#[derive(Debug, Error)]
pub enum StepError {
    /// The run's budget ceiling was crossed (halts as Partial)
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    /// The step judged its precondition or result unusable (halts as Failed)
    #[error("{0}")]
    Fatal(String),

    /// Anything else; treated like a fatal error
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl StepError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// One stage of the pipeline.
///
/// A step mutates the State in place. Recoverable problems are appended to
/// `state.failures`; returning an error halts the run.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, state: &mut State) -> Result<(), StepError>;

    /// Deadline override for this step (the run's step timeout otherwise)
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Ordered list of named steps
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: Vec<(String, Arc<dyn Step>)>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    pub fn register(mut self, name: impl Into<String>, step: impl Step + 'static) -> Self {
        self.steps.push((name.into(), Arc::new(step)));
        self
    }

    /// Append an already shared step
    pub fn register_shared(mut self, name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.steps.push((name.into(), step));
        self
    }

    /// Check that names are usable as checkpoint keys and unique
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            anyhow::bail!("Step registry must have at least one step");
        }

        let mut seen = HashSet::new();
        for (name, _) in &self.steps {
            if !is_valid_key_part(name) {
                anyhow::bail!("Invalid step name '{}'", name);
            }
            if !seen.insert(name.as_str()) {
                anyhow::bail!("Duplicate step name '{}'", name);
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Step>)> {
        self.steps.iter().map(|(name, step)| (name.as_str(), step))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|(name, _)| name.as_str())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|(n, _)| n == name)
    }

    /// Number of leading steps already completed in `state`.
    ///
    /// Uses the explicit cursor when it names a registered step. Otherwise
    /// (fresh state, checkpoint written before the cursor existed, or a
    /// cursor naming a step no longer registered) falls back to the longest
    /// prefix of steps whose output slot is populated.
    pub fn completed_count(&self, state: &State) -> usize {
        if let Stage::Completed { step } = &state.cursor {
            match self.position(step) {
                Some(index) => return index + 1,
                None => warn!(
                    step = %step,
                    "Cursor names an unregistered step; inferring progress from outputs"
                ),
            }
        }

        self.names()
            .take_while(|name| state.has_output(name))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunConfig;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Step for Noop {
        async fn run(&self, _state: &mut State) -> Result<(), StepError> {
            Ok(())
        }
    }

    fn registry() -> StepRegistry {
        StepRegistry::new()
            .register("s1", Noop)
            .register("s2", Noop)
            .register("s3", Noop)
    }

    #[test]
    fn test_validation() {
        assert!(registry().validate().is_ok());
        assert!(StepRegistry::new().validate().is_err());
        assert!(registry().register("s1", Noop).validate().is_err());
        assert!(StepRegistry::new().register("a--b", Noop).validate().is_err());
    }

    #[test]
    fn test_completed_count_from_cursor() {
        let mut state = State::new(RunConfig::new("run-1"));
        assert_eq!(registry().completed_count(&state), 0);

        state.mark_completed("s2");
        assert_eq!(registry().completed_count(&state), 2);
    }

    #[test]
    fn test_completed_count_from_outputs() {
        let mut state = State::new(RunConfig::new("run-1"));
        state.set_output("s1", json!(1));
        state.set_output("s3", json!(3));

        // s2 is missing, so only the s1 prefix counts
        assert_eq!(registry().completed_count(&state), 1);
    }

    #[test]
    fn test_unknown_cursor_falls_back_to_outputs() {
        let mut state = State::new(RunConfig::new("run-1"));
        state.set_output("s1", json!(1));
        state.mark_completed("renamed_step");

        assert_eq!(registry().completed_count(&state), 1);
    }

    #[test]
    fn test_step_error_conversions() {
        let budget: StepError = BudgetExceeded {
            total_cost: 1.2,
            limit: 1.0,
        }
        .into();
        assert!(matches!(budget, StepError::Budget(_)));

        let other: StepError = anyhow::anyhow!("disk full").into();
        assert_eq!(other.to_string(), "disk full");
    }
}
