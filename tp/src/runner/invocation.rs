//! Agent invocation parameters and argv construction

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::AgentConfig;
use crate::domain::Task;

/// Everything needed to spawn one agent process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// Executable to run
    pub command: String,

    /// Leading arguments before `-p`
    pub command_args: Vec<String>,

    /// Instruction passed with `-p`
    pub instruction: String,

    /// Working directory of the child
    pub working_dir: PathBuf,

    /// Value for `--permission-mode`
    pub permission_mode: String,

    /// Value for `--allowedTools`, joined with spaces
    pub tools: Vec<String>,

    /// Value for `--model`
    pub model: String,

    /// Wall-clock limit; None runs until exit or cancellation
    pub timeout: Option<Duration>,

    /// Wait between SIGTERM and SIGKILL
    pub kill_grace: Duration,
}

impl AgentInvocation {
    /// Invocation for a task run (single-shot or one loop iteration)
    ///
    /// The working directory is the task's project path, or `cwd` when unset.
    pub fn for_task(agent: &AgentConfig, task: &Task, instruction: impl Into<String>, cwd: &Path) -> Self {
        let model = if task.model.trim().is_empty() {
            agent.default_model.clone()
        } else {
            task.model.clone()
        };
        Self {
            command: agent.command.clone(),
            command_args: agent.command_args.clone(),
            instruction: instruction.into(),
            working_dir: task.project_path.clone().unwrap_or_else(|| cwd.to_path_buf()),
            permission_mode: agent.permission_mode.clone(),
            tools: agent.task_tools(task.allow_shell),
            model,
            timeout: None,
            kill_grace: agent.kill_grace(),
        }
    }

    /// Read-only invocation for codebase analysis with a hard deadline
    pub fn for_analysis(
        agent: &AgentConfig,
        instruction: impl Into<String>,
        project_path: &Path,
        model: Option<&str>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: agent.command.clone(),
            command_args: agent.command_args.clone(),
            instruction: instruction.into(),
            working_dir: project_path.to_path_buf(),
            permission_mode: agent.permission_mode.clone(),
            tools: agent.analysis_tools.clone(),
            model: model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(agent.default_model.as_str())
                .to_string(),
            timeout: Some(timeout),
            kill_grace: agent.kill_grace(),
        }
    }

    /// Arguments after the executable name
    pub fn args(&self) -> Vec<String> {
        let mut args = self.command_args.clone();
        args.extend([
            "-p".to_string(),
            self.instruction.clone(),
            "--permission-mode".to_string(),
            self.permission_mode.clone(),
            "--allowedTools".to_string(),
            self.tools.join(" "),
            "--model".to_string(),
            self.model.clone(),
        ]);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_argv_shape() {
        let agent = AgentConfig::default();
        let task = Task::new("Add logout button").with_model("opus");
        let inv = AgentInvocation::for_task(&agent, &task, "do it", Path::new("/work"));

        assert_eq!(
            inv.args(),
            vec![
                "-p",
                "do it",
                "--permission-mode",
                "acceptEdits",
                "--allowedTools",
                "Read Glob Grep Edit Write MultiEdit",
                "--model",
                "opus"
            ]
        );
        assert_eq!(inv.command, "claude");
        assert_eq!(inv.working_dir, PathBuf::from("/work"));
        assert!(inv.timeout.is_none());
    }

    #[test]
    fn test_command_args_lead() {
        let agent = AgentConfig {
            command: "npx".to_string(),
            command_args: vec!["@acme/agent".to_string()],
            ..AgentConfig::default()
        };
        let task = Task::new("Launcher");
        let inv = AgentInvocation::for_task(&agent, &task, "go", Path::new("/"));
        let args = inv.args();
        assert_eq!(&args[..3], ["@acme/agent", "-p", "go"]);
    }

    #[test]
    fn test_task_project_path_and_shell() {
        let agent = AgentConfig::default();
        let task = Task::new("Shell task").with_project_path("/proj").with_shell(true);
        let inv = AgentInvocation::for_task(&agent, &task, "x", Path::new("/elsewhere"));

        assert_eq!(inv.working_dir, PathBuf::from("/proj"));
        assert!(inv.tools.contains(&"Bash".to_string()));
    }

    #[test]
    fn test_blank_model_falls_back() {
        let agent = AgentConfig::default();
        let task = Task::new("No model").with_model("  ");
        let inv = AgentInvocation::for_task(&agent, &task, "x", Path::new("/"));
        assert_eq!(inv.model, agent.default_model);
    }

    #[test]
    fn test_analysis_is_read_only_with_deadline() {
        let agent = AgentConfig::default();
        let inv = AgentInvocation::for_analysis(&agent, "analyze", Path::new("/repo"), None, Duration::from_secs(5));

        assert_eq!(inv.tools, vec!["Read", "Glob", "Grep"]);
        assert_eq!(inv.timeout, Some(Duration::from_secs(5)));
        assert_eq!(inv.model, agent.default_model);
        assert_eq!(inv.working_dir, PathBuf::from("/repo"));
    }
}
