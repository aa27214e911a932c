//! tokio::process implementation of [`AgentExecutor`]

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{self, RunGuard};

use super::{AgentExecutor, AgentInvocation, OutputLine, OutputSink, ProcessOutput, READER_DRAIN_TIMEOUT};

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs the agent as a child process
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentExecutor for ProcessRunner {
    async fn run(&self, invocation: &AgentInvocation, guard: Option<&RunGuard>, sink: OutputSink) -> ProcessOutput {
        debug!(
            command = %invocation.command,
            working_dir = %invocation.working_dir.display(),
            model = %invocation.model,
            "ProcessRunner::run: called"
        );

        let token = guard.map(|g| g.token().clone()).unwrap_or_default();
        if token.is_cancelled() {
            debug!("ProcessRunner::run: cancelled before spawn");
            return ProcessOutput::cancelled(String::new());
        }

        let mut cmd = Command::new(&invocation.command);
        cmd.args(invocation.args())
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %invocation.command, error = %e, "ProcessRunner::run: spawn failed");
                return ProcessOutput::spawn_failed(e.to_string());
            }
        };

        // Register before the first await so a cancel can always reach the child
        let pid = child.id();
        if let (Some(guard), Some(pid)) = (guard, pid) {
            guard.attach_pid(pid);
        }
        info!(?pid, command = %invocation.command, "Agent process spawned");

        let captured = Arc::new(Mutex::new(Vec::<String>::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump_stdout(stdout, sink.clone(), captured.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_stderr(stderr, sink.clone())));

        let ended = wait_or_stop(&mut child, invocation.timeout, &token).await;

        let (status, timed_out, cancelled) = match ended {
            Ended::Exited(status) => (status, false, false),
            Ended::TimedOut => {
                warn!(?pid, timeout = ?invocation.timeout, "Agent timed out; terminating");
                (stop_child(&mut child, invocation.kill_grace).await, true, false)
            }
            Ended::Cancelled => {
                info!(?pid, "Run cancelled; terminating agent");
                (stop_child(&mut child, invocation.kill_grace).await, false, true)
            }
        };

        if let Some(guard) = guard {
            guard.detach_pid();
        }

        join_reader(stdout_task, "stdout").await;
        join_reader(stderr_task, "stderr").await;

        let output = captured.lock().unwrap_or_else(PoisonError::into_inner).join("\n");
        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "ProcessRunner::run: failed to observe exit");
                None
            }
        };

        debug!(?exit_code, timed_out, cancelled, output_len = output.len(), "ProcessRunner::run: finished");
        ProcessOutput {
            output,
            exit_code,
            timed_out,
            cancelled,
            spawn_error: None,
        }
    }
}

async fn wait_or_stop(child: &mut Child, timeout: Option<Duration>, token: &CancellationToken) -> Ended {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => Ended::Exited(status),
        () = deadline => Ended::TimedOut,
        () = token.cancelled() => Ended::Cancelled,
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL the group
///
/// The group is swept with SIGKILL even when the leader exits in time, so
/// tools it started that ignore SIGTERM cannot outlive the run.
async fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let pid = child.id();
    if let Some(pid) = pid {
        registry::terminate(pid);
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(?grace, "stop_child: agent ignored SIGTERM; killing group");
            match pid {
                Some(pid) => registry::kill_group(pid),
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "stop_child: start_kill failed");
                    }
                }
            }
            child.wait().await
        }
    };

    if let Some(pid) = pid {
        registry::kill_group(pid);
    }
    status
}

/// Read one line as raw bytes, stripping `\n` or `\r\n`
///
/// Invalid UTF-8 is replaced rather than treated as an error so the reader
/// keeps draining the pipe.
async fn read_line_lossy<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn pump_stdout<R: AsyncRead + Unpin>(reader: R, sink: OutputSink, captured: Arc<Mutex<Vec<String>>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                captured
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(line.clone());
                sink(OutputLine::Stdout(line));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "pump_stdout: read failed");
                break;
            }
        }
    }
}

async fn pump_stderr<R: AsyncRead + Unpin>(reader: R, sink: OutputSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if line.to_lowercase().contains("error") {
                    sink(OutputLine::Stderr(line));
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "pump_stderr: read failed");
                break;
            }
        }
    }
}

async fn join_reader(task: Option<JoinHandle<()>>, stream: &str) {
    let Some(task) = task else {
        return;
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(stream, error = %e, "join_reader: reader task failed"),
        Err(_) => {
            // A grandchild may still hold the pipe open; keep what we have
            warn!(stream, "join_reader: reader did not finish; abandoning");
            abort.abort();
        }
    }
}
