//! Task execution orchestrator
//!
//! The entry points other components call: start a single-shot run, start an
//! iteration loop, cancel either, or run a read-only codebase analysis. Every
//! entry point resolves to a terminal answer; none of them return an error.
//!
//! A run for a task always replaces any run already registered for it: the
//! previous run is cancelled, its process signalled, and the new run waits for
//! it to finish before spawning anything.

mod analysis;
mod ralph;
#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{LoopReport, RunOnceOutcome, Task, TaskPatch, TaskStatus};
use crate::events::{EventEmitter, EventPublisher};
use crate::prompts::PromptLoader;
use crate::registry::{RunGuard, RunRegistry};
use crate::runner::{self, AgentExecutor, AgentInvocation, OutputSink, ProcessRunner};
use crate::state::TaskRepository;

pub use analysis::{AnalysisRequest, parse_analysis_output, reconcile};
pub use ralph::RalphLoop;

/// Headroom for a stopped run's final store write and event publish
const FINAL_WRITE_SLACK: Duration = Duration::from_secs(2);

/// What a dispatched run ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    Once(RunOnceOutcome),
    Loop(LoopReport),
}

/// Wires the runner, registry, storage and event collaborators together
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<RunRegistry>,
    executor: Arc<dyn AgentExecutor>,
    store: Arc<dyn TaskRepository>,
    events: Arc<dyn EventPublisher>,
    prompts: Arc<PromptLoader>,
    cwd: PathBuf,
}

impl Orchestrator {
    /// Orchestrator with the real process runner, a fresh registry and
    /// prompts resolved against the current directory
    pub fn new(config: Config, store: Arc<dyn TaskRepository>, events: Arc<dyn EventPublisher>) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        debug!(cwd = %cwd.display(), "Orchestrator::new: called");
        Self {
            config: Arc::new(config),
            registry: Arc::new(RunRegistry::new()),
            executor: Arc::new(ProcessRunner::new()),
            store,
            events,
            prompts: Arc::new(PromptLoader::new(&cwd)),
            cwd,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptLoader) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    /// Working directory for tasks without a project path
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Whether a run is registered for `task_id`
    pub fn is_active(&self, task_id: &str) -> bool {
        self.registry.is_active(task_id)
    }

    /// Cancel the run for `task_id`; false when nothing was running
    pub fn cancel(&self, task_id: &str) -> bool {
        debug!(%task_id, "Orchestrator::cancel: called");
        self.registry.cancel(task_id)
    }

    /// Run `task` in whichever mode its loop flag selects
    pub async fn run(&self, task: Task) -> RunReport {
        if task.ralph.enabled {
            RunReport::Loop(self.run_loop(task).await)
        } else {
            RunReport::Once(self.run_once(task).await)
        }
    }

    /// Spawn [`Orchestrator::run`] on the runtime
    ///
    /// This is what a task-status-change handler calls when a task moves into
    /// an active state.
    pub fn dispatch(&self, task: Task) -> JoinHandle<RunReport> {
        info!(task_id = %task.id, ralph = task.ralph.enabled, "Dispatching task");
        let this = self.clone();
        tokio::spawn(async move { this.run(task).await })
    }

    /// How long a new run waits for the run it replaced
    ///
    /// Never shorter than a stopped agent can take to exit and drain, so a
    /// small `replace-wait-ms` cannot let two agents overlap.
    pub fn replace_wait(&self) -> Duration {
        let floor = runner::stop_bound(self.config.agent.kill_grace()) + FINAL_WRITE_SLACK;
        self.config.ralph.replace_wait().max(floor)
    }

    /// Register a run for `task_id`, replacing and awaiting any previous one
    async fn begin(&self, task_id: &str) -> RunGuard {
        let (guard, previous) = self.registry.start_or_replace(task_id);
        if let Some(previous) = previous {
            debug!(%task_id, "begin: waiting for previous run to finish");
            if !previous.wait_finished(self.replace_wait()).await {
                warn!(%task_id, "Previous run did not finish in time; starting anyway");
            }
        }
        guard
    }

    /// Invoke the agent once for `task`
    ///
    /// Exit 0 stores the output and marks the task done. A non-zero exit
    /// stores the output annotated with the exit code and leaves the workflow
    /// status alone.
    pub async fn run_once(&self, task: Task) -> RunOnceOutcome {
        debug!(task_id = %task.id, "run_once: called");
        let emitter = EventEmitter::new(self.events.clone(), &task.id);
        let guard = self.begin(&task.id).await;
        emitter.run_progress(format!("Starting: {}", task.title));

        let instruction = match self.prompts.task_prompt(&task) {
            Ok(instruction) => instruction,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "run_once: failed to build instruction");
                drop(guard);
                emitter.run_progress(format!("Run failed: {}", e));
                return RunOnceOutcome::Error { message: e.to_string() };
            }
        };

        let invocation = AgentInvocation::for_task(&self.config.agent, &task, instruction, &self.cwd);
        let result = self
            .executor
            .run(&invocation, Some(&guard), progress_sink(&emitter))
            .await;

        if result.cancelled || guard.is_cancelled() {
            info!(task_id = %task.id, "Run cancelled");
            drop(guard);
            emitter.run_progress("Run cancelled");
            return RunOnceOutcome::Cancelled;
        }

        if result.succeeded() {
            let patch = TaskPatch::new().output(result.output.clone()).status(TaskStatus::Done);
            let written = self.store.write(&task.id, patch).await;
            drop(guard);
            return match written {
                Ok(Some(updated)) => {
                    info!(task_id = %task.id, "Run completed");
                    emitter.task_updated(updated);
                    emitter.run_complete(result.output.clone());
                    RunOnceOutcome::Completed { output: result.output }
                }
                Ok(None) => {
                    warn!(task_id = %task.id, "run_once: task no longer exists");
                    RunOnceOutcome::Error {
                        message: format!("Task {} no longer exists", task.id),
                    }
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "run_once: failed to store result");
                    RunOnceOutcome::Error { message: e.to_string() }
                }
            };
        }

        let annotated = annotate_failure(&result.output, result.exit_code, result.spawn_error.as_deref());
        let written = self.store.write(&task.id, TaskPatch::new().output(annotated)).await;
        drop(guard);
        match written {
            Ok(Some(updated)) => {
                warn!(task_id = %task.id, exit_code = ?result.exit_code, "Run failed");
                emitter.task_updated(updated);
                emitter.run_progress(failure_message(result.exit_code, result.spawn_error.as_deref()));
                RunOnceOutcome::Failed {
                    exit_code: result.exit_code,
                }
            }
            Ok(None) => RunOnceOutcome::Error {
                message: format!("Task {} no longer exists", task.id),
            },
            Err(e) => {
                error!(task_id = %task.id, error = %e, "run_once: failed to store failure");
                RunOnceOutcome::Error { message: e.to_string() }
            }
        }
    }

    /// Drive the iteration loop for `task` until a terminal state
    pub async fn run_loop(&self, task: Task) -> LoopReport {
        debug!(task_id = %task.id, "run_loop: called");
        let guard = self.begin(&task.id).await;
        RalphLoop::new(self, &task, guard).run().await
    }
}

/// Forward every streamed line as a run-progress event
fn progress_sink(emitter: &EventEmitter) -> OutputSink {
    let emitter = emitter.clone();
    Arc::new(move |line| emitter.run_progress(line.text()))
}

fn exit_label(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code: {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn annotate_failure(output: &str, exit_code: Option<i32>, spawn_error: Option<&str>) -> String {
    let note = match spawn_error {
        Some(err) => format!("[failed to start agent: {}]", err),
        None => format!("[{}]", exit_label(exit_code)),
    };
    if output.is_empty() {
        note
    } else {
        format!("{}\n\n{}", output, note)
    }
}

fn failure_message(exit_code: Option<i32>, spawn_error: Option<&str>) -> String {
    match spawn_error {
        Some(err) => format!("Agent failed to start: {}", err),
        None => format!("Agent failed ({})", exit_label(exit_code)),
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::domain::{RunOutcome, RunStatus};
    use crate::events::TaskEvent;
    use crate::runner::SPAWN_FAILURE_EXIT_CODE;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_once_success() {
        let h = harness(vec![Step::ok("Done.")]);
        let task = Task::new("Add logout button");
        let id = h.state.create_task(task.clone()).await.unwrap();

        let outcome = h.orchestrator.run_once(task).await;

        assert_eq!(
            outcome,
            RunOnceOutcome::Completed {
                output: "Done.".to_string()
            }
        );
        let stored = h.state.get_task_required(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.output.as_deref(), Some("Done."));
        assert_eq!(h.events.count("run-complete"), 1);
        assert!(!h.orchestrator.is_active(&id));
    }

    #[tokio::test]
    async fn test_run_once_event_order() {
        let h = harness(vec![Step::ok("line 1\nline 2")]);
        let task = Task::new("Ordered");
        h.state.create_task(task.clone()).await.unwrap();

        h.orchestrator.run_once(task).await;

        assert_eq!(
            h.events.types(),
            vec!["run-progress", "run-progress", "run-progress", "task-updated", "run-complete"]
        );
        match &h.events.events()[3] {
            TaskEvent::TaskUpdated { task } => assert_eq!(task.status, TaskStatus::Done),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_once_instruction_from_task() {
        let h = harness(vec![Step::ok("ok")]);
        let task = Task::new("Add logout button").with_description("Top right corner");
        h.state.create_task(task.clone()).await.unwrap();

        h.orchestrator.run_once(task).await;

        let instructions = h.executor.instructions();
        assert_eq!(instructions.len(), 1);
        assert!(instructions[0].contains("Add logout button"));
        assert!(instructions[0].contains("Top right corner"));
    }

    #[tokio::test]
    async fn test_run_once_non_zero_exit_is_recoverable() {
        let h = harness(vec![Step::fail("oops", 2)]);
        let task = Task::new("Will fail");
        let id = h.state.create_task(task.clone()).await.unwrap();

        let outcome = h.orchestrator.run_once(task).await;

        assert_eq!(outcome, RunOnceOutcome::Failed { exit_code: Some(2) });
        let stored = h.state.get_task_required(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Todo);
        assert_eq!(stored.output.as_deref(), Some("oops\n\n[exit code: 2]"));
        assert_eq!(h.events.count("run-complete"), 0);
        assert_eq!(h.events.count("task-updated"), 1);
        assert!(!h.orchestrator.is_active(&id));
    }

    #[tokio::test]
    async fn test_run_once_spawn_failure() {
        let h = harness(vec![Step::SpawnFailure]);
        let task = Task::new("No agent");
        let id = h.state.create_task(task.clone()).await.unwrap();

        let outcome = h.orchestrator.run_once(task).await;

        assert_eq!(
            outcome,
            RunOnceOutcome::Failed {
                exit_code: Some(SPAWN_FAILURE_EXIT_CODE)
            }
        );
        let stored = h.state.get_task_required(&id).await.unwrap();
        assert!(stored.output.unwrap().starts_with("[failed to start agent:"));
        assert_eq!(stored.status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_run_once_storage_fault_is_error_not_panic() {
        let events = Arc::new(RecordingPublisher::default());
        let executor = Arc::new(ScriptedExecutor::new(vec![Step::ok("fine")]));
        let orchestrator = Orchestrator::new(Config::default(), Arc::new(FailingRepository), events)
            .with_executor(executor)
            .with_prompts(PromptLoader::embedded_only());
        let task = Task::new("Storage down");

        let outcome = orchestrator.run_once(task.clone()).await;

        assert!(matches!(outcome, RunOnceOutcome::Error { .. }));
        assert!(!orchestrator.is_active(&task.id));
    }

    #[tokio::test]
    async fn test_run_once_missing_task_is_error() {
        let h = harness(vec![Step::ok("fine")]);
        let task = Task::new("Never stored");

        let outcome = h.orchestrator.run_once(task).await;

        assert!(matches!(outcome, RunOnceOutcome::Error { .. }));
    }

    #[tokio::test]
    async fn test_replacing_run_stops_previous_first() {
        let h = harness(vec![Step::BlockUntilCancelled, Step::ok("second")]);
        let task = Task::new("Replace me");
        let id = h.state.create_task(task.clone()).await.unwrap();

        let first = {
            let orchestrator = h.orchestrator.clone();
            let task = task.clone();
            tokio::spawn(async move { orchestrator.run_once(task).await })
        };
        while !h.executor.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = h.orchestrator.run_once(task).await;
        let first = first.await.unwrap();

        assert_eq!(first, RunOnceOutcome::Cancelled);
        assert!(second.is_completed());
        assert_eq!(h.executor.max_concurrent.load(std::sync::atomic::Ordering::SeqCst), 1);
        let stored = h.state.get_task_required(&id).await.unwrap();
        assert_eq!(stored.output.as_deref(), Some("second"));
        assert!(!h.registry.is_active(&id));
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_noop() {
        let h = harness(vec![]);
        assert!(!h.orchestrator.cancel("nothing-running"));
    }

    #[tokio::test]
    async fn test_cancel_single_shot() {
        let h = harness(vec![Step::BlockUntilCancelled]);
        let task = Task::new("Cancel me");
        let id = h.state.create_task(task.clone()).await.unwrap();

        let run = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_once(task).await })
        };
        while !h.executor.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(h.orchestrator.cancel(&id));
        assert_eq!(run.await.unwrap(), RunOnceOutcome::Cancelled);
        assert!(!h.orchestrator.is_active(&id));
        let stored = h.state.get_task_required(&id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_dispatch_selects_mode() {
        let h = harness(vec![Step::ok("once"), Step::ok("<promise>TASK_COMPLETE</promise>")]);
        let once = Task::new("Once");
        let looped = Task::new("Looped").with_ralph(3, "");
        h.state.create_task(once.clone()).await.unwrap();
        h.state.create_task(looped.clone()).await.unwrap();

        let report = h.orchestrator.dispatch(once).await.unwrap();
        assert!(matches!(report, RunReport::Once(RunOnceOutcome::Completed { .. })));

        let report = h.orchestrator.dispatch(looped).await.unwrap();
        assert_eq!(
            report,
            RunReport::Loop(LoopReport {
                outcome: RunOutcome::PromiseFulfilled,
                iterations: 1
            })
        );
    }

    #[tokio::test]
    async fn test_independent_tasks_run_concurrently() {
        let h = harness(vec![Step::BlockUntilCancelled, Step::BlockUntilCancelled]);
        let a = Task::new("Task a");
        let b = Task::new("Task b");
        h.state.create_task(a.clone()).await.unwrap();
        h.state.create_task(b.clone()).await.unwrap();

        let ra = h.orchestrator.dispatch(a.clone());
        let rb = h.orchestrator.dispatch(b.clone());
        while h.executor.calls() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.orchestrator.is_active(&a.id) && h.orchestrator.is_active(&b.id));

        assert!(h.orchestrator.cancel(&a.id));
        assert_eq!(ra.await.unwrap(), RunReport::Once(RunOnceOutcome::Cancelled));
        assert!(h.orchestrator.is_active(&b.id));

        assert!(h.orchestrator.cancel(&b.id));
        assert_eq!(rb.await.unwrap(), RunReport::Once(RunOnceOutcome::Cancelled));
        assert_eq!(h.registry.active_count(), 0);
    }

    #[test]
    fn test_annotate_failure() {
        assert_eq!(annotate_failure("out", Some(1), None), "out\n\n[exit code: 1]");
        assert_eq!(annotate_failure("", None, None), "[terminated by signal]");
        assert_eq!(
            annotate_failure("", Some(127), Some("not found")),
            "[failed to start agent: not found]"
        );
    }

    #[tokio::test]
    async fn test_stored_run_status_untouched_by_single_shot() {
        let h = harness(vec![Step::ok("done")]);
        let task = Task::new("Plain");
        let id = h.state.create_task(task.clone()).await.unwrap();

        h.orchestrator.run_once(task).await;

        let stored = h.state.get_task_required(&id).await.unwrap();
        assert_eq!(stored.run_status, None::<RunStatus>);
    }

    #[test]
    fn test_replace_wait_covers_stop_bound() {
        let mut config = Config::default();
        config.agent.kill_grace_ms = 200;
        config.ralph.replace_wait_ms = 0;
        let store = Arc::new(FailingRepository);
        let orchestrator = Orchestrator::new(config.clone(), store.clone(), Arc::new(RecordingPublisher::default()));
        assert!(orchestrator.replace_wait() >= Duration::from_millis(200) + runner::READER_DRAIN_TIMEOUT * 2);

        config.ralph.replace_wait_ms = 60_000;
        let orchestrator = Orchestrator::new(config, store, Arc::new(RecordingPublisher::default()));
        assert_eq!(orchestrator.replace_wait(), Duration::from_secs(60));
    }
}
