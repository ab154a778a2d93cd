//! Domain types for the jobscout orchestrator.
//!
//! This module contains the core data structures:
//! - State: The document threaded through every step
//! - Checkpoint: Persisted snapshots of State
//! - FailureRecord: Recoverable and fatal problems
//! - RunOutcome: Terminal summary of a run

pub mod checkpoint;
pub mod failure;
pub mod outcome;
pub mod state;

// Re-export commonly used types
pub use checkpoint::{checkpoint_key, Checkpoint, CheckpointInfo, CheckpointLocation};
pub use failure::{FailureKind, FailureRecord};
pub use outcome::{RunOutcome, RunStatus};
pub use state::{BudgetLimits, RunConfig, RunLimits, Stage, State};
