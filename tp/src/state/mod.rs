//! State management
//!
//! The StateManager actor owns the TaskStore and serializes every read and
//! write. The orchestrator only sees the narrow [`TaskRepository`] seam.

mod manager;
mod messages;

use async_trait::async_trait;

use crate::domain::{Task, TaskPatch};

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};

/// Storage seam used by the orchestrator
///
/// `read` yields a fresh snapshot or None when the task no longer exists.
/// `write` applies a partial update and returns the full updated record, or
/// None when the task is gone.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn read(&self, task_id: &str) -> StateResponse<Option<Task>>;

    async fn write(&self, task_id: &str, patch: TaskPatch) -> StateResponse<Option<Task>>;
}
