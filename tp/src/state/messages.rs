//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{Task, TaskPatch, TaskStatus};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    CreateTask {
        task: Task,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    PatchTask {
        id: String,
        patch: TaskPatch,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    ListTasks {
        status_filter: Option<TaskStatus>,
        reply: oneshot::Sender<StateResponse<Vec<Task>>>,
    },
    DeleteTask {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },

    // Shutdown
    Shutdown,
}
