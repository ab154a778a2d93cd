//! Bounded fan-out executor.
//!
//! Runs many independent units of work (one scrape per company, one fetch
//! per posting) under a concurrency cap. Each unit's error, panic or timeout
//! is caught at the unit boundary and turned into a FailureRecord; nothing a
//! unit does can abort its siblings or escape the executor.
//!
//! Units complete in arbitrary order, so anything merging their results must
//! be order-independent (append, not index-based writes).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::domain::{FailureKind, FailureRecord, RunLimits, State};

/// One independent piece of work, tagged with the target it concerns
pub struct Unit<'a, T> {
    target: String,
    future: BoxFuture<'a, anyhow::Result<T>>,
}

impl<'a, T> Unit<'a, T> {
    pub fn new<F>(target: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'a,
    {
        Self {
            target: target.into(),
            future: Box::pin(future),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// What a single unit produced
#[derive(Debug)]
pub enum UnitResult<T> {
    Completed { target: String, value: T },
    Failed(FailureRecord),
}

impl<T> UnitResult<T> {
    /// Count the unit in `state`, recording its failure if it has one
    pub fn settle(self, state: &mut State) -> Option<T> {
        match self {
            UnitResult::Completed { value, .. } => {
                state.record_units(1, 1);
                Some(value)
            }
            UnitResult::Failed(failure) => {
                state.record_units(1, 0);
                state.record_failure(failure);
                None
            }
        }
    }
}

/// Collected results of a batch
#[derive(Debug)]
pub struct FanOutReport<T> {
    /// Contributions from successful units, in completion order
    pub results: Vec<T>,

    /// One record per failed unit
    pub failures: Vec<FailureRecord>,
}

impl<T> FanOutReport<T> {
    pub fn attempted(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    /// Count the batch in `state`, append its failures and hand back the results
    pub fn settle(self, state: &mut State) -> Vec<T> {
        state.record_units(self.attempted() as u64, self.results.len() as u64);
        for failure in self.failures {
            state.record_failure(failure);
        }
        self.results
    }
}

/// Counts for a batch drained through [`FanOut::run_each`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Semaphore-gated executor with per-unit failure isolation
#[derive(Debug, Clone)]
pub struct FanOut {
    /// Step name used as the origin of failure records
    origin: String,
    concurrency: usize,
    unit_timeout: Option<Duration>,
}

impl FanOut {
    /// Executor with the given concurrency cap (at least 1) and the default
    /// per-unit deadline from [`RunLimits`]
    pub fn new(origin: impl Into<String>, concurrency: usize) -> Self {
        Self {
            origin: origin.into(),
            concurrency: concurrency.max(1),
            unit_timeout: Some(RunLimits::default().unit_timeout()),
        }
    }

    /// Executor configured from a run's limits
    pub fn from_limits(origin: impl Into<String>, limits: &RunLimits) -> Self {
        Self::new(origin, limits.concurrency).with_unit_timeout(limits.unit_timeout())
    }

    /// Give each unit its own deadline
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }

    /// Let units run until the caller's own deadline
    pub fn without_unit_timeout(mut self) -> Self {
        self.unit_timeout = None;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout
    }

    /// Run every unit and collect results and failures. Never fails.
    pub async fn run_all<T>(&self, units: Vec<Unit<'_, T>>) -> FanOutReport<T> {
        let mut report = FanOutReport {
            results: Vec::new(),
            failures: Vec::new(),
        };

        let merged: Result<FanOutSummary, std::convert::Infallible> = self
            .run_each(units, |result| {
                match result {
                    UnitResult::Completed { value, .. } => report.results.push(value),
                    UnitResult::Failed(failure) => report.failures.push(failure),
                }
                Ok(())
            })
            .await;

        match merged {
            Ok(_) => report,
            Err(never) => match never {},
        }
    }

    /// Run every unit, handing each result to `merge` on the caller's task as
    /// soon as it completes.
    ///
    /// Results merged before a caller-side deadline fires are kept. If `merge`
    /// returns an error, units still in flight are dropped and the error is
    /// returned; unit failures themselves never stop the batch.
    pub async fn run_each<T, E, F>(
        &self,
        units: Vec<Unit<'_, T>>,
        mut merge: F,
    ) -> Result<FanOutSummary, E>
    where
        F: FnMut(UnitResult<T>) -> Result<(), E>,
    {
        let total = units.len();
        info!(
            origin = %self.origin,
            units = total,
            concurrency = self.concurrency,
            "Starting fan-out"
        );

        let semaphore = Semaphore::new(self.concurrency);
        let semaphore = &semaphore;
        let origin = self.origin.as_str();
        let unit_timeout = self.unit_timeout;

        let mut pending: FuturesUnordered<_> = units
            .into_iter()
            .map(|unit| async move {
                let Unit { target, future } = unit;

                // Held until the unit settles, whatever the outcome
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return UnitResult::Failed(
                            FailureRecord::new(origin, FailureKind::Other, "Fan-out pool closed")
                                .with_target(target),
                        )
                    }
                };

                debug!(origin, target = %target, "Unit started");
                let guarded = AssertUnwindSafe(future).catch_unwind();

                let outcome = match unit_timeout {
                    Some(limit) => match tokio::time::timeout(limit, guarded).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            return UnitResult::Failed(
                                FailureRecord::new(
                                    origin,
                                    FailureKind::Timeout,
                                    format!("Unit timed out after {:?}", limit),
                                )
                                .with_target(target),
                            )
                        }
                    },
                    None => guarded.await,
                };

                match outcome {
                    Ok(Ok(value)) => UnitResult::Completed { target, value },
                    Ok(Err(e)) => UnitResult::Failed(
                        FailureRecord::new(origin, FailureKind::UnitError, format!("{:#}", e))
                            .with_target(target),
                    ),
                    Err(panic) => UnitResult::Failed(
                        FailureRecord::new(origin, FailureKind::UnitPanic, panic_message(&*panic))
                            .with_target(target),
                    ),
                }
            })
            .collect();

        let mut summary = FanOutSummary::default();

        while let Some(result) = pending.next().await {
            summary.attempted += 1;
            match &result {
                UnitResult::Completed { target, .. } => {
                    summary.succeeded += 1;
                    debug!(origin, target = %target, "Unit completed");
                }
                UnitResult::Failed(failure) => {
                    summary.failed += 1;
                    warn!(
                        origin,
                        target = failure.target.as_deref().unwrap_or("-"),
                        kind = %failure.kind,
                        error = %failure.message,
                        "Unit failed"
                    );
                }
            }
            merge(result)?;
        }

        info!(
            origin = %self.origin,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Fan-out finished"
        );

        Ok(summary)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("Unit panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("Unit panicked: {}", message)
    } else {
        "Unit panicked".to_string()
    }
}
