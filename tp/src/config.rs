//! TaskPilot configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_COMPLETION_TOKEN, DEFAULT_MAX_ITERATIONS, DEFAULT_MODEL};

/// Main TaskPilot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error); CLI flag wins
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Agent executable and permissions
    pub agent: AgentConfig,

    /// Iteration loop defaults
    pub ralph: RalphDefaults,

    /// Codebase analysis settings
    pub analysis: AnalysisConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Event bus and event log settings
    pub events: EventsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .taskpilot.yml
        let local_config = PathBuf::from(".taskpilot.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskpilot/taskpilot.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskpilot").join("taskpilot.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Agent executable and permission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable (looked up on PATH)
    pub command: String,

    /// Arguments placed before the instruction, for launchers like `npx`
    #[serde(rename = "command-args")]
    pub command_args: Vec<String>,

    /// Non-interactive permission mode passed to the agent
    #[serde(rename = "permission-mode")]
    pub permission_mode: String,

    /// Model used when a task does not name one
    #[serde(rename = "default-model")]
    pub default_model: String,

    /// Tools every task may use
    #[serde(rename = "base-tools")]
    pub base_tools: Vec<String>,

    /// Tools added when a task allows shell access
    #[serde(rename = "shell-tools")]
    pub shell_tools: Vec<String>,

    /// Read-only tools for codebase analysis
    #[serde(rename = "analysis-tools")]
    pub analysis_tools: Vec<String>,

    /// Wait between SIGTERM and SIGKILL when stopping the agent
    #[serde(rename = "kill-grace-ms")]
    pub kill_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            command_args: Vec::new(),
            permission_mode: "acceptEdits".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            base_tools: ["Read", "Glob", "Grep", "Edit", "Write", "MultiEdit"]
                .into_iter()
                .map(String::from)
                .collect(),
            shell_tools: vec!["Bash".to_string()],
            analysis_tools: ["Read", "Glob", "Grep"].into_iter().map(String::from).collect(),
            kill_grace_ms: 3000,
        }
    }
}

impl AgentConfig {
    /// Allow-list for a task run
    pub fn task_tools(&self, allow_shell: bool) -> Vec<String> {
        let mut tools = self.base_tools.clone();
        if allow_shell {
            for tool in &self.shell_tools {
                if !tools.contains(tool) {
                    tools.push(tool.clone());
                }
            }
        }
        tools
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Iteration loop defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphDefaults {
    /// Iteration bound for tasks created with the loop enabled
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Completion token for tasks created with the loop enabled
    #[serde(rename = "completion-token")]
    pub completion_token: String,

    /// How long a new run waits for the run it replaced to finish
    ///
    /// Raised to the runner's stop bound when set lower.
    #[serde(rename = "replace-wait-ms")]
    pub replace_wait_ms: u64,
}

impl Default for RalphDefaults {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            completion_token: DEFAULT_COMPLETION_TOKEN.to_string(),
            replace_wait_ms: 10_000,
        }
    }
}

impl RalphDefaults {
    pub fn replace_wait(&self) -> Duration {
        Duration::from_millis(self.replace_wait_ms)
    }
}

/// Codebase analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Hard deadline for one analysis run
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { timeout_ms: 300_000 }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for TaskStore data
    #[serde(rename = "taskstore-dir")]
    pub taskstore_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            taskstore_dir: data_dir().to_string_lossy().into_owned(),
        }
    }
}

impl StorageConfig {
    pub fn path(&self) -> PathBuf {
        expand_home(&self.taskstore_dir)
    }
}

/// Event bus and event log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity
    pub capacity: usize,

    /// Directory holding per-task `events.jsonl` files
    #[serde(rename = "runs-dir")]
    pub runs_dir: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::events::DEFAULT_CHANNEL_CAPACITY,
            runs_dir: data_dir().join("runs").to_string_lossy().into_owned(),
        }
    }
}

impl EventsConfig {
    pub fn path(&self) -> PathBuf {
        expand_home(&self.runs_dir)
    }
}

/// XDG data directory (~/.local/share/taskpilot on Linux)
fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("taskpilot"))
        .unwrap_or_else(|| PathBuf::from(".taskpilot"))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
