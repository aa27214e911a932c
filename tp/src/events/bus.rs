//! Event Bus - pub/sub for task lifecycle events
//!
//! The orchestrator publishes through the [`EventPublisher`] seam. The bus is
//! the in-process implementation; subscribers (CLI printer, JSONL logger)
//! receive every event emitted after they subscribe.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{RunOutcome, Task};

use super::types::TaskEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// One-way publish capability
///
/// Delivery is not acknowledged and nothing is assumed about ordering across
/// different task ids.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

/// Broadcast-backed event bus
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: TaskEvent) {
        debug!(
            event_type = event.event_type(),
            task_id = event.task_id(),
            "EventBus::publish"
        );
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Per-task handle with convenience methods for each lifecycle event
#[derive(Clone)]
pub struct EventEmitter {
    publisher: Arc<dyn EventPublisher>,
    task_id: String,
}

impl EventEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, task_id: impl Into<String>) -> Self {
        Self {
            publisher,
            task_id: task_id.into(),
        }
    }

    /// Get the task ID this emitter is bound to
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn run_progress(&self, message: impl Into<String>) {
        self.publisher.publish(TaskEvent::RunProgress {
            task_id: self.task_id.clone(),
            message: message.into(),
        });
    }

    pub fn run_complete(&self, result: impl Into<String>) {
        self.publisher.publish(TaskEvent::RunComplete {
            task_id: self.task_id.clone(),
            result: result.into(),
        });
    }

    pub fn iteration_start(&self, iteration: u32, max_iterations: u32) {
        self.publisher.publish(TaskEvent::IterationStart {
            task_id: self.task_id.clone(),
            iteration,
            max_iterations,
        });
    }

    pub fn iteration_complete(&self, iteration: u32, promise_found: bool) {
        self.publisher.publish(TaskEvent::IterationComplete {
            task_id: self.task_id.clone(),
            iteration,
            promise_found,
        });
    }

    pub fn loop_complete(&self, iteration: u32, reason: RunOutcome) {
        self.publisher.publish(TaskEvent::LoopComplete {
            task_id: self.task_id.clone(),
            iteration,
            reason,
        });
    }

    pub fn task_updated(&self, task: Task) {
        self.publisher.publish(TaskEvent::TaskUpdated { task });
    }
}
