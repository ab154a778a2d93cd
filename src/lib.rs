//! jobscout - Resumable, budget-governed pipeline orchestrator
//!
//! Drives a fixed sequence of job-search steps (parse resume, discover
//! companies, scrape postings, score, notify, ...) over a shared State
//! document, so that a long run survives crashes, timeouts and spending
//! ceilings.
//!
//! # Architecture
//!
//! The system is built around checkpointed state:
//! - Every successful step persists a full snapshot of the State
//! - A run with the same id resumes from the most recent snapshot
//! - Metered calls are charged to the run and halt it at the ceiling
//! - Independent units of work fan out under a concurrency cap
//!
//! # Modules
//!
//! - `adapters`: External step programs (subprocess protocol)
//! - `core`: Orchestration logic (checkpoints, governor, fan-out, registry)
//! - `domain`: Data structures (State, Checkpoint, RunOutcome)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! jobscout run job_search --input resume=cv.pdf --budget 3
//!
//! # Check run status
//! jobscout status <run-id>
//!
//! # Resume a halted run
//! jobscout resume job_search <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{
    CallGovernor, CheckpointError, CheckpointStore, FanOut, FileCheckpointStore, Orchestrator,
    Pipeline, SqliteCheckpointStore, Step, StepError, StepRegistry,
};
pub use domain::{Checkpoint, FailureRecord, RunConfig, RunOutcome, RunStatus, State};
