//! TaskPilot - task execution orchestrator for autonomous coding agents
//!
//! TaskPilot hands a task to an external coding agent process and drives it to
//! a terminal state, either as a single invocation or as a Ralph loop: the
//! agent is re-invoked with a fresh instruction each iteration until it
//! reports completion with a promise tag or the iteration bound is reached.
//!
//! # Modules
//!
//! - [`runner`] - spawns the agent process and streams its output
//! - [`promise`] - completion-tag detection
//! - [`registry`] - at most one live run per task
//! - [`orchestrator`] - single-shot runs, the iteration loop and codebase analysis
//! - [`state`] - storage actor over TaskStore
//! - [`events`] - lifecycle event bus and JSONL event log
//! - [`prompts`] - Handlebars instruction templates
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod orchestrator;
pub mod promise;
pub mod prompts;
pub mod registry;
pub mod runner;
pub mod state;

// Re-export commonly used types
pub use config::Config;
pub use domain::{
    AnalysisRecord, AnalysisStatus, AnalysisSubject, Confidence, IterationResult, LoopReport, RalphConfig,
    RunOnceOutcome, RunOutcome, RunStatus, Task, TaskPatch, TaskStatus,
};
pub use events::{EventBus, EventEmitter, EventLogEntry, EventLogger, EventPublisher, TaskEvent, spawn_event_logger};
pub use orchestrator::{AnalysisRequest, Orchestrator, RalphLoop, RunReport};
pub use prompts::PromptLoader;
pub use registry::{RunGuard, RunRegistry};
pub use runner::{AgentExecutor, AgentInvocation, OutputLine, ProcessOutput, ProcessRunner};
pub use state::{StateError, StateManager, StateResponse, TaskRepository};
