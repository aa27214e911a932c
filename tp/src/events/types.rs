//! Event types for task lifecycle observability

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{RunOutcome, Task};

/// Lifecycle events published while a task runs
///
/// Serialized with a kebab-case `type` tag and camelCase payload fields,
/// e.g. `{"type":"iteration-start","taskId":"...","iteration":1,"maxIterations":3}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TaskEvent {
    /// Free-form progress line (agent stdout, diagnostics)
    RunProgress { task_id: String, message: String },

    /// A run finished successfully
    RunComplete { task_id: String, result: String },

    /// An iteration is about to spawn its agent process
    IterationStart {
        task_id: String,
        iteration: u32,
        max_iterations: u32,
    },

    /// An iteration finished its single pass
    IterationComplete {
        task_id: String,
        iteration: u32,
        promise_found: bool,
    },

    /// The iteration loop reached a terminal state
    LoopComplete {
        task_id: String,
        iteration: u32,
        reason: RunOutcome,
    },

    /// The orchestrator wrote fields back to the task
    TaskUpdated { task: Task },
}

impl TaskEvent {
    /// Task this event belongs to
    pub fn task_id(&self) -> &str {
        match self {
            Self::RunProgress { task_id, .. }
            | Self::RunComplete { task_id, .. }
            | Self::IterationStart { task_id, .. }
            | Self::IterationComplete { task_id, .. }
            | Self::LoopComplete { task_id, .. } => task_id,
            Self::TaskUpdated { task } => &task.id,
        }
    }

    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunProgress { .. } => "run-progress",
            Self::RunComplete { .. } => "run-complete",
            Self::IterationStart { .. } => "iteration-start",
            Self::IterationComplete { .. } => "iteration-complete",
            Self::LoopComplete { .. } => "loop-complete",
            Self::TaskUpdated { .. } => "task-updated",
        }
    }

    /// Whether this event ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunComplete { .. } | Self::LoopComplete { .. })
    }
}

/// A timestamped event as written to the JSONL log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: TaskEvent,
}

impl EventLogEntry {
    pub fn new(event: TaskEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
