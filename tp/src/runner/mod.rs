//! Process runner
//!
//! Spawns one external agent process per invocation, streams its output to a
//! sink for live relay, and resolves to a uniform [`ProcessOutput`]. The
//! [`AgentExecutor`] trait is the seam the orchestrator depends on; tests
//! substitute scripted executors.

mod invocation;
mod process;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::registry::RunGuard;

pub use invocation::AgentInvocation;
pub use process::ProcessRunner;

/// Exit code reported when the agent could not be spawned at all
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long each stream reader may take to drain after the child exits
pub const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a stopped agent can take to return from [`AgentExecutor::run`]
///
/// SIGTERM grace, then one drain window per output stream.
pub fn stop_bound(kill_grace: Duration) -> Duration {
    kill_grace + READER_DRAIN_TIMEOUT * 2
}

/// One line streamed from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    /// Only stderr lines mentioning an error are forwarded
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(line) | Self::Stderr(line) => line,
        }
    }
}

/// Live relay for streamed output
pub type OutputSink = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// A sink that drops everything
pub fn discard_sink() -> OutputSink {
    Arc::new(|_| {})
}

/// Result of one agent invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Captured stdout, lines joined with `\n`
    pub output: String,

    /// Exit code; None when killed by a signal
    pub exit_code: Option<i32>,

    /// The invocation's deadline elapsed and the process was terminated
    pub timed_out: bool,

    /// The run's token fired and the process was terminated (or never spawned)
    pub cancelled: bool,

    /// Why the process could not be spawned
    pub spawn_error: Option<String>,
}

impl ProcessOutput {
    pub fn spawn_failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            exit_code: Some(SPAWN_FAILURE_EXIT_CODE),
            timed_out: false,
            cancelled: false,
            spawn_error: Some(error.into()),
        }
    }

    pub fn cancelled(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: None,
            timed_out: false,
            cancelled: true,
            spawn_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one agent invocation to completion
///
/// Implementations attach the live pid to `guard` immediately after spawning
/// and stop the process when the guard's token is cancelled. They never fail:
/// spawn errors, timeouts and cancellation are all reported in the output.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, invocation: &AgentInvocation, guard: Option<&RunGuard>, sink: OutputSink) -> ProcessOutput;
}
