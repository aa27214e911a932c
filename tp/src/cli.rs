//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// TaskPilot - task execution orchestrator
#[derive(Parser)]
#[command(
    name = "tp",
    about = "Run coding-agent tasks once or in a Ralph loop until they report completion",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Run a task to a terminal state (mode follows the task's loop flag)
    Run {
        /// Task ID (or partial match)
        id: String,

        /// Force a single invocation
        #[arg(long, conflicts_with = "loop_mode")]
        once: bool,

        /// Force the iteration loop
        #[arg(long = "loop")]
        loop_mode: bool,
    },

    /// Analyze how far each subject is implemented in a project (read-only)
    Analyze {
        /// Project directory
        path: PathBuf,

        /// Subject to assess (repeatable)
        #[arg(short, long = "subject", required = true)]
        subjects: Vec<String>,

        /// Agent model
        #[arg(short, long)]
        model: Option<String>,

        /// Deadline in seconds (defaults to the configured analysis timeout)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the recorded lifecycle events of a task
    Events {
        /// Task ID (or partial match)
        id: String,
    },
}

/// Task management subcommands
#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a task
    Create {
        /// Task title
        title: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,

        /// Project directory the agent works in
        #[arg(short, long)]
        project: Option<PathBuf>,

        /// Agent model
        #[arg(short, long)]
        model: Option<String>,

        /// Allow shell tools
        #[arg(long)]
        shell: bool,

        /// Run as a Ralph loop
        #[arg(long = "loop")]
        ralph: bool,

        /// Iteration bound for the loop
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Completion token the agent must promise
        #[arg(long)]
        token: Option<String>,
    },

    /// List tasks
    List {
        /// Filter by status (backlog, todo, in_progress, done)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show a task and its last output
    Show {
        /// Task ID (or partial match)
        id: String,
    },

    /// Delete a task
    Delete {
        /// Task ID (or partial match)
        id: String,
    },
}
