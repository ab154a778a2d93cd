//! Main orchestrator for pipeline execution.
//!
//! Drives the step registry against a State: resumes from the latest
//! checkpoint, runs each remaining step under a deadline, checkpoints after
//! every success and turns budget, fatal and timeout failures into a
//! terminal RunOutcome. Only checkpoint persistence errors escape `run`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, field, info, info_span, instrument, warn, Instrument};

use crate::domain::checkpoint::is_valid_key_part;
use crate::domain::{
    Checkpoint, FailureKind, FailureRecord, RunConfig, RunOutcome, RunStatus, State,
};

use super::checkpoint_store::{CheckpointError, CheckpointStore};
use super::governor::log_usage_summary;
use super::registry::{Step, StepError, StepRegistry};
use super::tracer::{NoopTracer, SpanKind, SpanRecord, SpanStatus, Tracer};

/// Result of running a single step
#[derive(Debug)]
pub enum StepTransition {
    /// The step completed; continue with the next one
    Advanced,

    /// The run must stop here
    Halted(RunOutcome),
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    registry: StepRegistry,

    /// Checkpoint backend (None disables checkpointing)
    store: Option<Arc<dyn CheckpointStore>>,

    tracer: Arc<dyn Tracer>,
}

impl Orchestrator {
    /// Create an orchestrator for a registry, without checkpointing
    pub fn new(registry: StepRegistry) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            registry,
            store: None,
            tracer: Arc::new(NoopTracer),
        })
    }

    /// Enable checkpointing to the given store
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Report spans to the given tracer
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn checkpoint_store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.store.as_ref()
    }

    /// Execute a run, resuming from its latest checkpoint if one exists
    #[instrument(skip(self, config), fields(run_id = %config.run_id))]
    pub async fn run(&self, config: RunConfig) -> Result<RunOutcome, CheckpointError> {
        let started = Instant::now();
        check_run_id(&config.run_id)?;

        let (state, resumed_from) = match self.load_checkpoint(&config.run_id).await? {
            Some((state, step)) => {
                if state.config != config {
                    warn!("Run configuration differs from checkpoint; keeping the checkpointed configuration");
                }
                (state, Some(step))
            }
            None => (State::new(config), None),
        };

        self.drive(state, resumed_from, started).await
    }

    /// Resume a run from its latest checkpoint.
    ///
    /// Returns None when checkpointing is disabled or the run has no
    /// checkpoint.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: &str) -> Result<Option<RunOutcome>, CheckpointError> {
        let started = Instant::now();
        check_run_id(run_id)?;

        match self.load_checkpoint(run_id).await? {
            Some((state, step)) => self.drive(state, Some(step), started).await.map(Some),
            None => Ok(None),
        }
    }

    /// Latest checkpointed state for a run, with the step it was taken after
    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<(State, String)>, CheckpointError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        match store.load_latest(run_id).await? {
            Some(checkpoint) => {
                let state = checkpoint.restore()?;
                info!(
                    run_id,
                    step = %checkpoint.step_name,
                    saved_at = %checkpoint.saved_at,
                    backend = store.backend(),
                    "Found checkpoint"
                );
                Ok(Some((state, checkpoint.step_name)))
            }
            None => Ok(None),
        }
    }

    /// Run every step not yet completed in `state`
    async fn drive(
        &self,
        mut state: State,
        resumed_from: Option<String>,
        started: Instant,
    ) -> Result<RunOutcome, CheckpointError> {
        let run_id = state.run_id().to_string();
        let completed = self.registry.completed_count(&state);

        match &resumed_from {
            Some(step) => info!(
                %run_id,
                after_step = %step,
                completed,
                remaining = self.registry.len() - completed,
                "Resuming run"
            ),
            None => info!(%run_id, steps = self.registry.len(), "Starting run"),
        }
        self.tracer.record(
            &SpanRecord::new(&run_id, SpanKind::Run, &run_id, SpanStatus::Started)
                .with_usage(state.total_cost, state.total_units),
        );

        for (index, (name, step)) in self.registry.iter().enumerate() {
            if index < completed {
                debug!(step = name, "Step already completed, skipping");
                self.tracer.record(
                    &SpanRecord::new(&run_id, SpanKind::Step, name, SpanStatus::Skipped)
                        .with_usage(state.total_cost, state.total_units),
                );
                continue;
            }

            match self.run_step(name, step.as_ref(), &mut state, started).await? {
                StepTransition::Advanced => {}
                StepTransition::Halted(outcome) => {
                    self.finish_run(&outcome);
                    return Ok(outcome);
                }
            }
        }

        let outcome = match &state.result {
            Some(result) => result.clone(),
            None => {
                let outcome = RunOutcome::from_state(&state, RunStatus::Success, started.elapsed());
                state.result = Some(outcome.clone());
                outcome
            }
        };

        log_usage_summary(&state);
        self.finish_run(&outcome);
        Ok(outcome)
    }

    /// Execute one step under its deadline and checkpoint on success
    pub async fn run_step(
        &self,
        name: &str,
        step: &dyn Step,
        state: &mut State,
        run_started: Instant,
    ) -> Result<StepTransition, CheckpointError> {
        let run_id = state.run_id().to_string();
        let limit = step
            .timeout()
            .unwrap_or_else(|| state.config.limits.step_timeout());

        let span = info_span!(
            "step",
            step = name,
            status = field::Empty,
            cost_usd = field::Empty,
            units = field::Empty
        );

        info!(%run_id, step = name, timeout_secs = limit.as_secs(), "Step started");
        self.tracer.record(
            &SpanRecord::new(&run_id, SpanKind::Step, name, SpanStatus::Started)
                .with_usage(state.total_cost, state.total_units),
        );

        let step_started = Instant::now();
        let result = tokio::time::timeout(limit, step.run(state))
            .instrument(span.clone())
            .await;
        let duration_ms = step_started.elapsed().as_millis() as u64;

        span.record("cost_usd", state.total_cost);
        span.record("units", state.total_units);

        let (status, failure, span_status) = match result {
            Ok(Ok(())) => {
                state.mark_completed(name);

                if let Some(store) = &self.store {
                    let checkpoint = Checkpoint::capture(name, state)?;
                    let location = store.save(&checkpoint).await.map_err(|e| {
                        error!(%run_id, step = name, error = %e, "Failed to write checkpoint");
                        e
                    })?;
                    debug!(step = name, %location, "Checkpoint saved");
                }

                span.record("status", "ok");
                info!(
                    %run_id,
                    step = name,
                    duration_ms,
                    total_cost = state.total_cost,
                    "Step completed"
                );
                self.tracer.record(
                    &SpanRecord::new(&run_id, SpanKind::Step, name, SpanStatus::Ok)
                        .with_usage(state.total_cost, state.total_units)
                        .with_duration(duration_ms),
                );
                return Ok(StepTransition::Advanced);
            }
            Ok(Err(StepError::Budget(exceeded))) => (
                RunStatus::Partial,
                FailureRecord::new(name, FailureKind::BudgetExceeded, exceeded.to_string()),
                SpanStatus::BudgetExceeded,
            ),
            Ok(Err(StepError::Fatal(message))) => (
                RunStatus::Failed,
                FailureRecord::new(name, FailureKind::Fatal, message),
                SpanStatus::Failed,
            ),
            Ok(Err(StepError::Unexpected(e))) => (
                RunStatus::Failed,
                FailureRecord::new(name, FailureKind::Fatal, format!("{:#}", e)),
                SpanStatus::Failed,
            ),
            Err(_) => (
                RunStatus::Failed,
                FailureRecord::new(name, FailureKind::Timeout, timeout_message(name, limit)),
                SpanStatus::TimedOut,
            ),
        };

        span.record("status", status.to_string().as_str());
        error!(
            %run_id,
            step = name,
            kind = %failure.kind,
            error = %failure.message,
            duration_ms,
            "Step halted the run"
        );
        self.tracer.record(
            &SpanRecord::new(&run_id, SpanKind::Step, name, span_status)
                .with_usage(state.total_cost, state.total_units)
                .with_duration(duration_ms)
                .with_error(failure.message.clone()),
        );

        state.record_failure(failure.fatal());
        log_usage_summary(state);

        let outcome = RunOutcome::from_state(state, status, run_started.elapsed()).halted_at(name);
        Ok(StepTransition::Halted(outcome))
    }

    /// Log and trace the end of a run
    fn finish_run(&self, outcome: &RunOutcome) {
        let span_status = match outcome.status {
            RunStatus::Success => SpanStatus::Ok,
            RunStatus::Partial => SpanStatus::BudgetExceeded,
            RunStatus::Failed => SpanStatus::Failed,
        };

        match outcome.status {
            RunStatus::Success => info!(
                run_id = %outcome.run_id,
                duration_ms = outcome.duration_ms,
                total_cost = outcome.total_cost,
                "Run completed successfully"
            ),
            _ => warn!(
                run_id = %outcome.run_id,
                status = %outcome.status,
                halted_at = outcome.halted_at.as_deref().unwrap_or("-"),
                failures = outcome.failures.len(),
                "Run halted"
            ),
        }

        let mut span = SpanRecord::new(&outcome.run_id, SpanKind::Run, &outcome.run_id, span_status)
            .with_usage(outcome.total_cost, outcome.total_units)
            .with_duration(outcome.duration_ms);
        if let Some(fatal) = outcome.fatal_failures().last() {
            span = span.with_error(fatal.message.clone());
        }
        self.tracer.record(&span);
    }
}

/// Run ids name checkpoint keys and trace directories
fn check_run_id(run_id: &str) -> Result<(), CheckpointError> {
    if is_valid_key_part(run_id) {
        Ok(())
    } else {
        Err(CheckpointError::InvalidKey(run_id.to_string()))
    }
}

fn timeout_message(step: &str, limit: Duration) -> String {
    format!("Step '{}' exceeded its {:?} deadline", step, limit)
}
