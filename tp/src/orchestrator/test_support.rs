//! Scripted collaborators for orchestrator tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};

use crate::config::Config;
use crate::domain::{Task, TaskPatch};
use crate::events::{EventPublisher, TaskEvent};
use crate::prompts::PromptLoader;
use crate::registry::{RunGuard, RunRegistry};
use crate::runner::{AgentExecutor, AgentInvocation, OutputLine, OutputSink, ProcessOutput};
use crate::state::{StateError, StateManager, StateResponse, TaskRepository};

use super::Orchestrator;

/// Orchestrator over a temp store with scripted agent runs
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub state: StateManager,
    pub events: Arc<RecordingPublisher>,
    pub executor: Arc<ScriptedExecutor>,
    pub registry: Arc<RunRegistry>,
    pub temp: TempDir,
}

/// Must be called inside a tokio runtime (the state actor is spawned)
pub fn harness(steps: Vec<Step>) -> Harness {
    let temp = tempdir().unwrap();
    let state = StateManager::spawn(temp.path()).unwrap();
    let events = Arc::new(RecordingPublisher::default());
    let registry = Arc::new(RunRegistry::new());
    let executor = Arc::new(ScriptedExecutor::new(steps).with_registry(registry.clone()));
    let orchestrator = Orchestrator::new(Config::default(), Arc::new(state.clone()), events.clone())
        .with_executor(executor.clone())
        .with_registry(registry.clone())
        .with_prompts(PromptLoader::embedded_only())
        .with_cwd(temp.path());
    Harness {
        orchestrator,
        state,
        events,
        executor,
        registry,
        temp,
    }
}

/// What one scripted agent invocation does
#[derive(Debug, Clone)]
pub enum Step {
    /// Print `output` and exit with `code`
    Exit { output: String, code: i32 },
    /// Fail to spawn
    SpawnFailure,
    /// Print `output`, then get cancelled through the registry mid-run
    CancelMidRun { output: String },
    /// Block until the run's token is cancelled
    BlockUntilCancelled,
    /// Time out (analysis)
    TimeOut { output: String },
}

impl Step {
    pub fn ok(output: &str) -> Self {
        Self::Exit {
            output: output.to_string(),
            code: 0,
        }
    }

    pub fn fail(output: &str, code: i32) -> Self {
        Self::Exit {
            output: output.to_string(),
            code,
        }
    }
}

/// Executor that plays back a script instead of spawning processes
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    registry: Option<Arc<RunRegistry>>,
    pub invocations: Mutex<Vec<AgentInvocation>>,
    running: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            registry: None,
            invocations: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Registry used by `CancelMidRun` to cancel like an external caller would
    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn instructions(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.instruction.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn run(&self, invocation: &AgentInvocation, guard: Option<&RunGuard>, sink: OutputSink) -> ProcessOutput {
        if guard.is_some_and(|g| g.is_cancelled()) {
            return ProcessOutput::cancelled(String::new());
        }

        self.invocations.lock().unwrap().push(invocation.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(|| Step::ok(""));
        let result = match step {
            Step::Exit { output, code } => {
                for line in output.lines() {
                    sink(OutputLine::Stdout(line.to_string()));
                }
                ProcessOutput {
                    output,
                    exit_code: Some(code),
                    timed_out: false,
                    cancelled: false,
                    spawn_error: None,
                }
            }
            Step::SpawnFailure => ProcessOutput::spawn_failed("No such file or directory (os error 2)"),
            Step::CancelMidRun { output } => {
                let guard = guard.expect("CancelMidRun needs a guard");
                let registry = self.registry.as_ref().expect("CancelMidRun needs a registry");
                assert!(registry.cancel(guard.task_id()));
                ProcessOutput::cancelled(output)
            }
            Step::BlockUntilCancelled => {
                let guard = guard.expect("BlockUntilCancelled needs a guard");
                guard.token().cancelled().await;
                ProcessOutput::cancelled("")
            }
            Step::TimeOut { output } => ProcessOutput {
                output,
                exit_code: None,
                timed_out: true,
                cancelled: false,
                spawn_error: None,
            },
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Publisher that keeps every event
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event_type()).collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.types().iter().filter(|t| **t == event_type).count()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: TaskEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Repository whose backing store is unreachable
pub struct FailingRepository;

#[async_trait]
impl TaskRepository for FailingRepository {
    async fn read(&self, _task_id: &str) -> StateResponse<Option<Task>> {
        Err(StateError::StoreError("database is locked".to_string()))
    }

    async fn write(&self, _task_id: &str, _patch: TaskPatch) -> StateResponse<Option<Task>> {
        Err(StateError::StoreError("database is locked".to_string()))
    }
}

/// Repository that simulates an external edit of the task after `edit_after_reads` reads
pub struct EditingRepository<R> {
    pub inner: R,
    reads: AtomicU32,
    edit_after_reads: u32,
    edit: Box<dyn Fn(&mut Task) + Send + Sync>,
}

impl<R: TaskRepository> EditingRepository<R> {
    pub fn new(inner: R, edit_after_reads: u32, edit: impl Fn(&mut Task) + Send + Sync + 'static) -> Self {
        Self {
            inner,
            reads: AtomicU32::new(0),
            edit_after_reads,
            edit: Box::new(edit),
        }
    }
}

#[async_trait]
impl<R: TaskRepository> TaskRepository for EditingRepository<R> {
    async fn read(&self, task_id: &str) -> StateResponse<Option<Task>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let mut task = self.inner.read(task_id).await?;
        if n > self.edit_after_reads {
            if let Some(task) = task.as_mut() {
                (self.edit)(task);
            }
        }
        Ok(task)
    }

    async fn write(&self, task_id: &str, patch: TaskPatch) -> StateResponse<Option<Task>> {
        self.inner.write(task_id, patch).await
    }
}
