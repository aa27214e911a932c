//! Event Logger - persists events to JSONL files
//!
//! Every event lands in `<runs_dir>/<task_id>/events.jsonl` for history and
//! replay with `tp events <id>`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::Context;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, TaskEvent};

const EVENTS_FILE: &str = "events.jsonl";

/// Event logger that writes events to JSONL files
pub struct EventLogger {
    runs_dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

impl EventLogger {
    pub fn new(runs_dir: impl AsRef<Path>) -> Self {
        let runs_dir = runs_dir.as_ref().to_path_buf();
        debug!(?runs_dir, "EventLogger::new: creating logger");
        Self {
            runs_dir,
            writers: HashMap::new(),
        }
    }

    /// Append an event to its task's log file
    pub fn write_event(&mut self, event: &TaskEvent) -> eyre::Result<()> {
        let task_id = event.task_id().to_string();
        debug!(%task_id, event_type = event.event_type(), "EventLogger::write_event");

        let writer = match self.writers.entry(task_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let task_dir = self.runs_dir.join(entry.key());
                fs::create_dir_all(&task_dir).context(format!("Failed to create {}", task_dir.display()))?;

                let log_path = task_dir.join(EVENTS_FILE);
                debug!(?log_path, "EventLogger: opening log file");
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .context(format!("Failed to open {}", log_path.display()))?;
                entry.insert(BufWriter::new(file))
            }
        };

        let json = serde_json::to_string(&EventLogEntry::new(event.clone()))?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    /// Close the writer for a task
    pub fn close_task(&mut self, task_id: &str) {
        debug!(%task_id, "EventLogger::close_task");
        if let Some(mut writer) = self.writers.remove(task_id) {
            let _ = writer.flush();
        }
    }

    /// Consume events until the bus is dropped
    pub async fn run(mut self, mut rx: broadcast::Receiver<TaskEvent>) {
        debug!("EventLogger::run: starting event logger");

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_event(&event) {
                        error!(task_id = event.task_id(), error = %e, "EventLogger: failed to write event");
                    }
                    if event.is_terminal() {
                        self.close_task(event.task_id());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }

        for (task_id, mut writer) in self.writers.drain() {
            debug!(%task_id, "EventLogger: flushing writer on shutdown");
            let _ = writer.flush();
        }
    }
}

/// Read a task's logged events in order
pub fn read_task_events(runs_dir: impl AsRef<Path>, task_id: &str) -> eyre::Result<Vec<EventLogEntry>> {
    let log_path = runs_dir.as_ref().join(task_id).join(EVENTS_FILE);
    debug!(?log_path, "read_task_events: reading log file");

    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&log_path).context(format!("Failed to read {}", log_path.display()))?;
    let mut entries = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(line, error = %e, "read_task_events: failed to parse line");
            }
        }
    }

    debug!(count = entries.len(), "read_task_events: loaded entries");
    Ok(entries)
}

/// Spawn the event logger as a background task
///
/// Subscribes before returning so no event published afterwards is missed.
pub fn spawn_event_logger(bus: &EventBus, runs_dir: impl AsRef<Path>) -> tokio::task::JoinHandle<()> {
    let logger = EventLogger::new(runs_dir);
    let rx = bus.subscribe();
    tokio::spawn(logger.run(rx))
}
