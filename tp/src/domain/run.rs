//! Run outcome types
//!
//! Transient values produced while a task runs. None of these are persisted
//! directly; they are folded into [`super::TaskPatch`] writes and lifecycle events.

use serde::{Deserialize, Serialize};

/// Terminal reason for a run or loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The agent emitted the expected promise tag
    PromiseFulfilled,
    /// The iteration bound was reached without a promise
    MaxReached,
    /// Cancelled externally or replaced by a newer run
    Cancelled,
    /// The orchestrator could not proceed (storage unreachable, task vanished)
    Error,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromiseFulfilled => "promise_fulfilled",
            Self::MaxReached => "max_reached",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one loop pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationResult {
    /// Everything the agent wrote to stdout during this pass
    pub captured_output: String,

    /// Exit code, None when the process was killed or never observed to exit
    pub exit_code: Option<i32>,

    /// Whether the promise tag matched the completion token
    pub promise_matched: bool,
}

impl IterationResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Final report of an iteration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub outcome: RunOutcome,

    /// Iterations started (never exceeds the configured maximum)
    pub iterations: u32,
}

/// Result of a single-shot run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOnceOutcome {
    /// Agent exited 0; task marked done
    Completed { output: String },
    /// Agent exited non-zero or was killed; output annotated, status unchanged
    Failed { exit_code: Option<i32> },
    /// Replaced or cancelled before finishing
    Cancelled,
    /// Internal fault (storage unreachable, task missing)
    Error { message: String },
}

impl RunOnceOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
