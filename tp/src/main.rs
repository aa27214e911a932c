//! TaskPilot - task execution orchestrator
//!
//! CLI entry point for managing tasks and running them through the agent.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tokio::sync::broadcast;
use tracing::{debug, info};

use taskpilot::cli::{Cli, Command, TaskCommand};
use taskpilot::config::Config;
use taskpilot::domain::{AnalysisStatus, RalphConfig, RunOnceOutcome, RunOutcome, Task, TaskStatus, resolve_partial};
use taskpilot::events::{EventBus, TaskEvent, read_task_events, spawn_event_logger};
use taskpilot::orchestrator::{AnalysisRequest, Orchestrator, RunReport};
use taskpilot::state::StateManager;
use taskpilot::{AnalysisRecord, AnalysisSubject};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskpilot")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(log_dir.join("taskpilot.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Loaded before logging so the config file can set the level
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    info!(agent = %config.agent.command, "TaskPilot loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Task { command } => cmd_task(&config, command).await,
        Command::Run { id, once, loop_mode } => cmd_run(config, &id, once, loop_mode).await,
        Command::Analyze {
            path,
            subjects,
            model,
            timeout,
            json,
        } => cmd_analyze(config, path, subjects, model, timeout, json).await,
        Command::Events { id } => cmd_events(&config, &id).await,
    }
}

/// Resolve a partial task reference to a stored task
async fn resolve_task(state: &StateManager, reference: &str) -> Result<Task> {
    debug!(%reference, "resolve_task: called");
    let tasks = state.list_tasks(None).await?;
    let id = match resolve_partial(tasks.iter().map(|t| t.id.as_str()), reference) {
        Ok(Some(id)) => id,
        Ok(None) => return Err(eyre!("No task matches '{}'", reference)),
        Err(candidates) => {
            return Err(eyre!(
                "'{}' is ambiguous; candidates: {}",
                reference,
                candidates.join(", ")
            ));
        }
    };
    tasks
        .into_iter()
        .find(|t| t.id == id)
        .ok_or_else(|| eyre!("Task {} disappeared", id))
}

fn colored_status(status: TaskStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        TaskStatus::Done => text.green(),
        TaskStatus::InProgress => text.yellow(),
        TaskStatus::Todo => text.cyan(),
        TaskStatus::Backlog => text.dimmed(),
    }
}

/// Handle task management commands
async fn cmd_task(config: &Config, command: TaskCommand) -> Result<()> {
    debug!(?command, "cmd_task: called");
    let state = StateManager::spawn(config.storage.path())?;

    match command {
        TaskCommand::Create {
            title,
            description,
            project,
            model,
            shell,
            ralph,
            max_iterations,
            token,
        } => {
            let mut task = Task::new(title)
                .with_model(model.unwrap_or_else(|| config.agent.default_model.clone()))
                .with_shell(shell);
            if let Some(description) = description {
                task = task.with_description(description);
            }
            if let Some(project) = project {
                let project = project
                    .canonicalize()
                    .context(format!("Project directory {} not found", project.display()))?;
                task = task.with_project_path(project);
            }
            if ralph || max_iterations.is_some() || token.is_some() {
                task = task.with_ralph(
                    max_iterations.unwrap_or(config.ralph.max_iterations),
                    token.unwrap_or_else(|| config.ralph.completion_token.clone()),
                );
            }

            let id = state.create_task(task).await?;
            info!(%id, "Created task");
            println!("{} {}", "Created".green(), id.bold());
        }
        TaskCommand::List { status } => {
            let filter = status
                .map(|s| s.parse::<TaskStatus>())
                .transpose()
                .map_err(|e| eyre!(e))?;
            let tasks = state.list_tasks(filter).await?;
            if tasks.is_empty() {
                println!("No tasks found");
            } else {
                println!("{:<40} {:<12} {:<18} {}", "ID", "STATUS", "RUN", "TITLE");
                println!("{}", "-".repeat(90));
                for task in tasks {
                    let run = task.run_status.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<40} {:<12} {:<18} {}",
                        task.id,
                        colored_status(task.status),
                        run,
                        task.title
                    );
                }
            }
        }
        TaskCommand::Show { id } => {
            let task = resolve_task(&state, &id).await?;
            println!("{}  {}", task.id.bold(), task.title);
            println!("  status:     {}", colored_status(task.status));
            if let Some(description) = &task.description {
                println!("  description: {}", description);
            }
            if let Some(project) = &task.project_path {
                println!("  project:    {}", project.display());
            }
            println!("  model:      {}", task.model);
            println!("  shell:      {}", task.allow_shell);
            if task.ralph.enabled {
                println!(
                    "  loop:       iteration {}/{} (token {})",
                    task.current_iteration,
                    task.ralph.effective_max(),
                    task.ralph.token()
                );
            }
            if let Some(run_status) = task.run_status {
                println!("  run:        {}", run_status);
            }
            if let Some(output) = &task.output {
                println!("\n{}", output);
            }
        }
        TaskCommand::Delete { id } => {
            let task = resolve_task(&state, &id).await?;
            if state.delete_task(&task.id).await? {
                println!("{} {}", "Deleted".red(), task.id);
            }
        }
    }

    state.shutdown().await;
    Ok(())
}

/// Print lifecycle events for one run until the bus closes
async fn print_events(mut rx: broadcast::Receiver<TaskEvent>) {
    loop {
        match rx.recv().await {
            Ok(TaskEvent::RunProgress { message, .. }) => println!("{}", message),
            Ok(TaskEvent::IterationStart {
                iteration,
                max_iterations,
                ..
            }) => println!("{}", format!("=== Iteration {}/{} ===", iteration, max_iterations).cyan()),
            Ok(TaskEvent::IterationComplete {
                iteration,
                promise_found: true,
                ..
            }) => println!("{}", format!("Iteration {}: promise found", iteration).green()),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("{}", format!("({} events dropped)", n).dimmed());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_report(report: &RunReport) {
    match report {
        RunReport::Once(RunOnceOutcome::Completed { .. }) => println!("{}", "Completed".green().bold()),
        RunReport::Once(RunOnceOutcome::Failed { exit_code }) => {
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            println!("{} (exit {})", "Failed".yellow().bold(), code);
        }
        RunReport::Once(RunOnceOutcome::Cancelled) => println!("{}", "Cancelled".yellow()),
        RunReport::Once(RunOnceOutcome::Error { message }) => println!("{} {}", "Error:".red().bold(), message),
        RunReport::Loop(report) => {
            let reason = match report.outcome {
                RunOutcome::PromiseFulfilled => report.outcome.to_string().green().bold(),
                RunOutcome::MaxReached | RunOutcome::Cancelled => report.outcome.to_string().yellow(),
                RunOutcome::Error => report.outcome.to_string().red().bold(),
            };
            println!("Loop finished: {} after {} iteration(s)", reason, report.iterations);
        }
    }
}

/// Run a task in the foreground; Ctrl-C cancels it
async fn cmd_run(config: Config, reference: &str, once: bool, loop_mode: bool) -> Result<()> {
    debug!(%reference, once, loop_mode, "cmd_run: called");
    let state = StateManager::spawn(config.storage.path())?;
    let mut task = resolve_task(&state, reference).await?;

    if once {
        task.ralph.enabled = false;
    } else if loop_mode && !task.ralph.enabled {
        task.ralph = RalphConfig {
            enabled: true,
            max_iterations: config.ralph.max_iterations,
            completion_token: config.ralph.completion_token.clone(),
        };
    }

    let bus = Arc::new(EventBus::new(config.events.capacity));
    let logger = spawn_event_logger(&bus, config.events.path());
    let printer = tokio::spawn(print_events(bus.subscribe()));

    let task_id = task.id.clone();
    let orchestrator = Orchestrator::new(config, Arc::new(state.clone()), bus.clone());
    let mut run = orchestrator.dispatch(task);

    let report = tokio::select! {
        joined = &mut run => joined.context("Run task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling...".yellow());
            orchestrator.cancel(&task_id);
            run.await.context("Run task panicked")?
        }
    };

    // Closing the bus lets the printer and logger drain and exit
    drop(orchestrator);
    drop(bus);
    let _ = printer.await;
    let _ = logger.await;

    print_report(&report);
    state.shutdown().await;
    Ok(())
}

fn colored_verdict(status: AnalysisStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        AnalysisStatus::Complete => text.green(),
        AnalysisStatus::Partial => text.yellow(),
        AnalysisStatus::NotStarted => text.red(),
        AnalysisStatus::Unknown => text.dimmed(),
    }
}

/// Analyze implementation progress of the given subjects
async fn cmd_analyze(
    config: Config,
    path: PathBuf,
    subjects: Vec<String>,
    model: Option<String>,
    timeout: Option<u64>,
    json: bool,
) -> Result<()> {
    debug!(?path, ?subjects, "cmd_analyze: called");
    let path = path
        .canonicalize()
        .context(format!("Project directory {} not found", path.display()))?;
    let state = StateManager::spawn(config.storage.path())?;
    let orchestrator = Orchestrator::new(config, Arc::new(state.clone()), Arc::new(EventBus::new(16)));

    let mut request = AnalysisRequest::new(path, subjects.into_iter().map(AnalysisSubject::new).collect());
    if let Some(model) = model {
        request = request.with_model(model);
    }
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    if !json {
        println!("{}", "Analyzing...".dimmed());
    }
    let records: Vec<AnalysisRecord> = orchestrator.analyze(request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            println!(
                "{} [{} / {}]",
                record.subject_title.bold(),
                colored_verdict(record.status),
                record.confidence
            );
            if !record.evidence.is_empty() {
                println!("  {}", record.evidence);
            }
        }
    }

    state.shutdown().await;
    Ok(())
}

/// Print a task's recorded events
async fn cmd_events(config: &Config, reference: &str) -> Result<()> {
    debug!(%reference, "cmd_events: called");
    let state = StateManager::spawn(config.storage.path())?;
    let task = resolve_task(&state, reference).await?;
    state.shutdown().await;

    let entries = read_task_events(config.events.path(), &task.id)?;
    if entries.is_empty() {
        println!("No events recorded for {}", task.id);
        return Ok(());
    }

    for entry in entries {
        let detail = match &entry.event {
            TaskEvent::RunProgress { message, .. } => message.clone(),
            TaskEvent::RunComplete { result, .. } => format!("{} bytes of output", result.len()),
            TaskEvent::IterationStart {
                iteration,
                max_iterations,
                ..
            } => format!("{}/{}", iteration, max_iterations),
            TaskEvent::IterationComplete {
                iteration,
                promise_found,
                ..
            } => format!("{} promise_found={}", iteration, promise_found),
            TaskEvent::LoopComplete { iteration, reason, .. } => format!("{} {}", reason, iteration),
            TaskEvent::TaskUpdated { task } => format!(
                "status={} run={}",
                task.status,
                task.run_status.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
            ),
        };
        println!(
            "{} {:<18} {}",
            entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            entry.event.event_type(),
            detail
        );
    }
    Ok(())
}
