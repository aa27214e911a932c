//! Iteration loop controller
//!
//! Runs the agent repeatedly against the same task until it emits the
//! completion promise, the iteration bound is reached, or the run is
//! cancelled. Each pass rebuilds its instruction from a fresh read of the
//! task so edits made between iterations take effect.

use eyre::{Context, Result, eyre};
use tracing::{debug, error, info, warn};

use crate::domain::{IterationResult, LoopReport, RunOutcome, RunStatus, Task, TaskPatch, TaskStatus};
use crate::events::EventEmitter;
use crate::promise;
use crate::registry::RunGuard;
use crate::runner::AgentInvocation;

use super::{Orchestrator, exit_label, progress_sink};

/// One loop run for one task
///
/// Owns the task's registry guard for its whole lifetime; the guard is
/// released after the final write and before the terminal events.
pub struct RalphLoop<'a> {
    orchestrator: &'a Orchestrator,
    task_id: String,
    title: String,
    max_iterations: u32,
    guard: Option<RunGuard>,
    emitter: EventEmitter,
    transcript: String,
    iteration: u32,
}

impl<'a> RalphLoop<'a> {
    /// The iteration bound is fixed from `task` when the loop starts
    pub fn new(orchestrator: &'a Orchestrator, task: &Task, guard: RunGuard) -> Self {
        Self {
            orchestrator,
            task_id: task.id.clone(),
            title: task.title.clone(),
            max_iterations: task.ralph.effective_max(),
            guard: Some(guard),
            emitter: EventEmitter::new(orchestrator.events.clone(), &task.id),
            transcript: String::new(),
            iteration: 0,
        }
    }

    /// Drive the loop to a terminal state and write the result back
    pub async fn run(mut self) -> LoopReport {
        info!(task_id = %self.task_id, max_iterations = self.max_iterations, "Starting loop");
        self.emitter.run_progress(format!(
            "Starting loop: {} (max {} iterations)",
            self.title, self.max_iterations
        ));

        let outcome = match self.iterate().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %self.task_id, iteration = self.iteration, error = %e, "Loop failed");
                self.emitter.run_progress(format!("Loop failed: {}", e));
                RunOutcome::Error
            }
        };

        self.finish(outcome).await
    }

    fn is_cancelled(&self) -> bool {
        self.guard.as_ref().is_some_and(RunGuard::is_cancelled)
    }

    async fn iterate(&mut self) -> Result<RunOutcome> {
        self.write(TaskPatch::new().run_status(RunStatus::Running).iteration(0))
            .await?;

        loop {
            if self.is_cancelled() {
                debug!(task_id = %self.task_id, iteration = self.iteration, "iterate: cancelled between iterations");
                return Ok(RunOutcome::Cancelled);
            }

            self.iteration += 1;
            self.write(TaskPatch::new().iteration(self.iteration)).await?;
            self.emitter.iteration_start(self.iteration, self.max_iterations);

            let result = self.run_iteration().await?;
            self.emitter
                .iteration_complete(self.iteration, result.promise_matched);

            if result.promise_matched {
                info!(task_id = %self.task_id, iteration = self.iteration, "Promise fulfilled");
                return Ok(RunOutcome::PromiseFulfilled);
            }

            if self.is_cancelled() {
                debug!(task_id = %self.task_id, iteration = self.iteration, "iterate: cancelled during iteration");
                return Ok(RunOutcome::Cancelled);
            }

            if !result.succeeded() {
                warn!(
                    task_id = %self.task_id,
                    iteration = self.iteration,
                    exit_code = ?result.exit_code,
                    "Iteration failed; continuing"
                );
                self.emitter.run_progress(format!(
                    "Iteration {} failed ({}); continuing",
                    self.iteration,
                    exit_label(result.exit_code)
                ));
            }

            if self.iteration >= self.max_iterations {
                info!(task_id = %self.task_id, iteration = self.iteration, "Max iterations reached");
                return Ok(RunOutcome::MaxReached);
            }
        }
    }

    async fn run_iteration(&mut self) -> Result<IterationResult> {
        let orchestrator = self.orchestrator;
        let task = orchestrator
            .store
            .read(&self.task_id)
            .await
            .context("Failed to read task snapshot")?
            .ok_or_else(|| eyre!("Task {} no longer exists", self.task_id))?;

        let instruction = orchestrator
            .prompts
            .iteration_prompt(&task, self.iteration, self.max_iterations)?;
        let invocation = AgentInvocation::for_task(&orchestrator.config.agent, &task, instruction, &orchestrator.cwd);

        let output = orchestrator
            .executor
            .run(&invocation, self.guard.as_ref(), progress_sink(&self.emitter))
            .await;
        debug!(
            task_id = %self.task_id,
            iteration = self.iteration,
            exit_code = ?output.exit_code,
            cancelled = output.cancelled,
            "run_iteration: agent finished"
        );

        self.append_transcript(&output.output);
        let promise_matched = promise::detect(&output.output, task.ralph.token());

        Ok(IterationResult {
            captured_output: output.output,
            exit_code: output.exit_code,
            promise_matched,
        })
    }

    fn append_transcript(&mut self, output: &str) {
        if !self.transcript.is_empty() {
            self.transcript.push_str("\n\n");
        }
        self.transcript
            .push_str(&format!("--- Iteration {} ---\n\n{}", self.iteration, output));
    }

    /// Persist a patch and announce the new record
    async fn write(&self, patch: TaskPatch) -> Result<Task> {
        let task = self
            .orchestrator
            .store
            .write(&self.task_id, patch)
            .await
            .context("Failed to write task")?
            .ok_or_else(|| eyre!("Task {} no longer exists", self.task_id))?;
        self.emitter.task_updated(task.clone());
        Ok(task)
    }

    async fn finish(mut self, outcome: RunOutcome) -> LoopReport {
        let mut patch = TaskPatch::new()
            .output(self.transcript.clone())
            .run_status(outcome.into())
            .iteration(self.iteration);
        if outcome == RunOutcome::PromiseFulfilled {
            patch = patch.status(TaskStatus::Done);
        }

        let written = self.orchestrator.store.write(&self.task_id, patch).await;
        drop(self.guard.take());

        let outcome = match written {
            Ok(Some(task)) => {
                self.emitter.task_updated(task);
                outcome
            }
            Ok(None) => {
                warn!(task_id = %self.task_id, "finish: task no longer exists");
                RunOutcome::Error
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "finish: failed to store loop result");
                RunOutcome::Error
            }
        };

        info!(task_id = %self.task_id, iterations = self.iteration, %outcome, "Loop finished");
        self.emitter.loop_complete(self.iteration, outcome);
        if outcome == RunOutcome::PromiseFulfilled {
            self.emitter.run_complete(std::mem::take(&mut self.transcript));
        }

        LoopReport {
            outcome,
            iterations: self.iteration,
        }
    }
}
