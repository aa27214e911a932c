//! Domain types for TaskPilot
//!
//! `Task` implements the Record trait for TaskStore persistence. Run outcome
//! and analysis types are transient and never stored on their own.

mod analysis;
mod id;
mod run;
mod task;

pub use analysis::{AnalysisRecord, AnalysisStatus, AnalysisSubject, Confidence};
pub use id::{generate_task_id, resolve_partial};
pub use run::{IterationResult, LoopReport, RunOnceOutcome, RunOutcome};
pub use task::{
    DEFAULT_COMPLETION_TOKEN, DEFAULT_MAX_ITERATIONS, DEFAULT_MODEL, RalphConfig, RunStatus, Task, TaskPatch,
    TaskStatus,
};

// Re-export taskstore types for convenience
pub use taskstore::{Filter, FilterOp, IndexValue, Record, Store};
