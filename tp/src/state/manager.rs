//! StateManager - actor that owns TaskStore
//!
//! Processes commands via channels for thread-safe access to persistent state.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{Filter, IndexValue, Store, Task, TaskPatch, TaskStatus};

use super::TaskRepository;
use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "spawn: called");
        let mut store = Store::open(store_path.as_ref())?;

        let task_count = store.rebuild_indexes::<Task>()?;
        info!(task_count, "Rebuilt indexes for Task records");

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));

        info!("StateManager spawned");
        Ok(Self { tx })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Create a new Task record
    pub async fn create_task(&self, task: Task) -> StateResponse<String> {
        debug!(task_id = %task.id, "create_task: called");
        self.request(|reply| StateCommand::CreateTask { task, reply }).await
    }

    /// Get a Task record by ID
    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        debug!(%id, "get_task: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::GetTask { id, reply }).await
    }

    /// Get a Task record by ID, returning error if not found
    pub async fn get_task_required(&self, id: &str) -> StateResponse<Task> {
        debug!(%id, "get_task_required: called");
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Task {}", id)))
    }

    /// Apply a partial update, returning the new record (None if missing)
    pub async fn patch_task(&self, id: &str, patch: TaskPatch) -> StateResponse<Option<Task>> {
        debug!(%id, ?patch, "patch_task: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::PatchTask { id, patch, reply }).await
    }

    /// List tasks, optionally filtered by workflow status
    pub async fn list_tasks(&self, status_filter: Option<TaskStatus>) -> StateResponse<Vec<Task>> {
        debug!(?status_filter, "list_tasks: called");
        self.request(|reply| StateCommand::ListTasks { status_filter, reply })
            .await
    }

    /// Delete a task, returning whether it existed
    pub async fn delete_task(&self, id: &str) -> StateResponse<bool> {
        debug!(%id, "delete_task: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::DeleteTask { id, reply }).await
    }

    /// Stop the actor
    pub async fn shutdown(&self) {
        debug!("shutdown: called");
        if self.tx.send(StateCommand::Shutdown).await.is_err() {
            warn!("shutdown: actor already stopped");
        }
    }
}

#[async_trait]
impl TaskRepository for StateManager {
    async fn read(&self, task_id: &str) -> StateResponse<Option<Task>> {
        self.get_task(task_id).await
    }

    async fn write(&self, task_id: &str, patch: TaskPatch) -> StateResponse<Option<Task>> {
        self.patch_task(task_id, patch).await
    }
}

fn store_err(e: eyre::Report) -> StateError {
    StateError::StoreError(e.to_string())
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateTask { task, reply } => {
                debug!(task_id = %task.id, "actor_loop: CreateTask command");
                let _ = reply.send(store.create(task).map_err(store_err));
            }

            StateCommand::GetTask { id, reply } => {
                debug!(%id, "actor_loop: GetTask command");
                let _ = reply.send(store.get::<Task>(&id).map_err(store_err));
            }

            StateCommand::PatchTask { id, patch, reply } => {
                debug!(%id, "actor_loop: PatchTask command");
                let result = match store.get::<Task>(&id) {
                    Ok(Some(mut task)) => {
                        task.apply(patch);
                        store.update(task.clone()).map(|_| Some(task)).map_err(store_err)
                    }
                    Ok(None) => {
                        debug!(%id, "actor_loop: PatchTask on missing task");
                        Ok(None)
                    }
                    Err(e) => Err(store_err(e)),
                };
                let _ = reply.send(result);
            }

            StateCommand::ListTasks { status_filter, reply } => {
                debug!(?status_filter, "actor_loop: ListTasks command");
                let filters: Vec<Filter> = status_filter
                    .map(|status| Filter::eq("status", IndexValue::String(status.to_string())))
                    .into_iter()
                    .collect();
                let _ = reply.send(store.list::<Task>(&filters).map_err(store_err));
            }

            StateCommand::DeleteTask { id, reply } => {
                debug!(%id, "actor_loop: DeleteTask command");
                let _ = reply.send(store.delete::<Task>(&id).map_err(store_err));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                break;
            }
        }
    }

    info!("StateManager actor stopped");
}
