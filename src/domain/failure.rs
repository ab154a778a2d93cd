//! Failure records accumulated during a run.
//!
//! Steps append these for problems that should not halt the whole run
//! (one scrape target timing out, a malformed response). The orchestrator
//! appends a fatal record when it halts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded failure, fatal or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Step (or component) that reported the failure
    pub origin: String,

    /// Category of failure
    pub kind: FailureKind,

    /// Human-readable message
    pub message: String,

    /// Identifier of the unit/target involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,

    /// Whether this failure halted the run
    #[serde(default)]
    pub is_fatal: bool,
}

impl FailureRecord {
    /// Create a non-fatal failure record with the current timestamp
    pub fn new(origin: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            kind,
            message: message.into(),
            target: None,
            timestamp: Utc::now(),
            is_fatal: false,
        }
    }

    /// Attach the identifier of the unit that failed
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Mark the failure as run-halting
    pub fn fatal(mut self) -> Self {
        self.is_fatal = true;
        self
    }
}

/// Categories of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Hard budget ceiling reached
    BudgetExceeded,

    /// A step judged its precondition or result unusable
    Fatal,

    /// A step or unit missed its deadline
    Timeout,

    /// A fan-out unit returned an error
    UnitError,

    /// A fan-out unit panicked
    UnitPanic,

    /// Anything else a step wants to report
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::Fatal => "fatal",
            FailureKind::Timeout => "timeout",
            FailureKind::UnitError => "unit_error",
            FailureKind::UnitPanic => "unit_panic",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}
