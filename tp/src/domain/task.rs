//! Task domain type
//!
//! A Task is the unit of delegated work. It is owned by the storage layer; the
//! orchestrator reads snapshots and writes back a small set of fields through
//! [`TaskPatch`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use taskstore::{IndexValue, Record, now_ms};

use super::id::generate_task_id;
use super::run::RunOutcome;

/// Completion token used when a task does not configure one
pub const DEFAULT_COMPLETION_TOKEN: &str = "TASK_COMPLETE";

/// Default iteration bound for new tasks
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Default agent model selector
pub const DEFAULT_MODEL: &str = "sonnet";

/// Workflow status, owned by the board. The orchestrator only ever writes `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    #[default]
    Todo,
    InProgress,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backlog => write!(f, "backlog"),
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "backlog" => Ok(Self::Backlog),
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Run state of the iteration loop for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    PromiseFulfilled,
    MaxReached,
    Cancelled,
    Error,
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::PromiseFulfilled => Self::PromiseFulfilled,
            RunOutcome::MaxReached => Self::MaxReached,
            RunOutcome::Cancelled => Self::Cancelled,
            RunOutcome::Error => Self::Error,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::PromiseFulfilled => write!(f, "promise_fulfilled"),
            Self::MaxReached => write!(f, "max_reached"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Iteration loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphConfig {
    /// Run the task as an iteration loop instead of a single invocation
    pub enabled: bool,

    /// Upper bound on iterations
    pub max_iterations: u32,

    /// Expected interior of the `<promise>` tag
    pub completion_token: String,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            completion_token: DEFAULT_COMPLETION_TOKEN.to_string(),
        }
    }
}

impl RalphConfig {
    /// Iteration bound, never below one
    pub fn effective_max(&self) -> u32 {
        self.max_iterations.max(1)
    }

    /// Completion token, falling back to the default when blank
    pub fn token(&self) -> &str {
        let token = self.completion_token.trim();
        if token.is_empty() { DEFAULT_COMPLETION_TOKEN } else { token }
    }
}

/// A unit of delegated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: String,

    /// Short title
    pub title: String,

    /// Longer description of the work
    #[serde(default)]
    pub description: Option<String>,

    /// Project directory the agent works in (orchestrator cwd when unset)
    #[serde(default)]
    pub project_path: Option<PathBuf>,

    /// Whether the agent may use shell tools
    #[serde(default)]
    pub allow_shell: bool,

    /// Agent model selector
    pub model: String,

    /// Iteration loop configuration
    #[serde(default)]
    pub ralph: RalphConfig,

    /// Last iteration started by the loop (0 before the first)
    #[serde(default)]
    pub current_iteration: u32,

    /// Loop run state (None when no loop has run)
    #[serde(default)]
    pub run_status: Option<RunStatus>,

    /// Captured agent output
    #[serde(default)]
    pub output: Option<String>,

    /// Workflow status
    #[serde(default)]
    pub status: TaskStatus,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Task {
    /// Create a new task with a generated ID
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let now = now_ms();
        Self {
            id: generate_task_id(&title),
            title,
            description: None,
            project_path: None,
            allow_shell: false,
            model: DEFAULT_MODEL.to_string(),
            ralph: RalphConfig::default(),
            current_iteration: 0,
            run_status: None,
            output: None,
            status: TaskStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the project directory
    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    /// Set the model selector
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Allow shell tools
    pub fn with_shell(mut self, allow: bool) -> Self {
        self.allow_shell = allow;
        self
    }

    /// Enable the iteration loop
    pub fn with_ralph(mut self, max_iterations: u32, completion_token: impl Into<String>) -> Self {
        self.ralph = RalphConfig {
            enabled: true,
            max_iterations,
            completion_token: completion_token.into(),
        };
        self
    }

    /// Apply a partial update, bumping `updated_at`
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(output) = patch.output {
            self.output = Some(output);
        }
        if let Some(iteration) = patch.current_iteration {
            self.current_iteration = iteration;
        }
        if let Some(run_status) = patch.run_status {
            self.run_status = Some(run_status);
        }
        self.updated_at = now_ms();
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(run_status) = self.run_status {
            fields.insert("run_status".to_string(), IndexValue::String(run_status.to_string()));
        }
        fields
    }
}

/// Partial update of the fields the orchestrator owns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub output: Option<String>,
    pub current_iteration: Option<u32>,
    pub run_status: Option<RunStatus>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn iteration(mut self, iteration: u32) -> Self {
        self.current_iteration = Some(iteration);
        self
    }

    pub fn run_status(mut self, run_status: RunStatus) -> Self {
        self.run_status = Some(run_status);
        self
    }
}
