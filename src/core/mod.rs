//! Core orchestration logic.
//!
//! This module contains:
//! - CheckpointStore: Durable snapshots of run state (file and SQLite)
//! - CallGovernor: Usage accounting and budget enforcement
//! - FanOut: Bounded concurrent execution of independent units
//! - StepRegistry: Ordered pipeline topology
//! - Pipeline: YAML pipeline definitions and loading
//! - Orchestrator: Main execution engine

pub mod checkpoint_store;
pub mod fanout;
pub mod governor;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod sqlite_store;
pub mod tracer;

// Re-export commonly used types
pub use checkpoint_store::{CheckpointError, CheckpointStore, FileCheckpointStore};
pub use fanout::{FanOut, FanOutReport, FanOutSummary, Unit, UnitResult};
pub use governor::{BudgetExceeded, CallGovernor, PriceTable, UnitPrice, Usage};
pub use orchestrator::{Orchestrator, StepTransition};
pub use pipeline::{JobStage, Pipeline, RetryPolicy, StepSpec};
pub use registry::{Step, StepError, StepRegistry};
pub use sqlite_store::SqliteCheckpointStore;
pub use tracer::{JournalTracer, NoopTracer, SpanKind, SpanRecord, SpanStatus, Tracer};
