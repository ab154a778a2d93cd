//! Adapters for external step programs.
//!
//! Pipeline definitions name a program per step; the command adapter turns
//! each one into a `Step` the orchestrator can drive.

pub mod command;

pub use command::{CommandStep, ReportedFailure, StepRequest, StepResponse, UnitCounts};
