//! Task lifecycle events
//!
//! The orchestrator publishes through [`EventPublisher`]; the [`EventBus`]
//! fans events out to subscribers such as the CLI printer and the
//! [`EventLogger`].
//!
//! ```text
//!   RalphLoop / run_once
//!          │ publish
//!          ▼
//!   ┌──────────────┐
//!   │   EventBus   │  tokio::sync::broadcast
//!   └──────────────┘
//!      │        │
//!      ▼        ▼
//!   CLI out   events.jsonl
//! ```

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, EventPublisher};
pub use logger::{EventLogger, read_task_events, spawn_event_logger};
pub use types::{EventLogEntry, TaskEvent};
