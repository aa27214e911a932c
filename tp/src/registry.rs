//! Task run registry
//!
//! Tracks at most one live run per task id. Each run owns a [`RunGuard`]; the
//! guard removes its own entry when dropped, so every exit path (success,
//! error, panic, cancellation) leaves the registry clean.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RunEntry {
    run_id: u64,
    token: CancellationToken,
    pid: Option<u32>,
    finished: watch::Receiver<bool>,
}

#[derive(Default)]
struct Runs {
    live: HashMap<String, RunEntry>,
    /// Cancelled runs that may still be writing their final state
    draining: HashMap<String, Draining>,
}

struct Draining {
    run_id: u64,
    finished: watch::Receiver<bool>,
}

/// Concurrency-safe map from task id to its live run
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<Runs>,
    next_run_id: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Runs> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh run for `task_id`, cancelling whatever was there
    ///
    /// The previous run (if any) is cancelled and its process signalled before
    /// this returns. A run stopped earlier by [`RunRegistry::cancel`] that has
    /// not finished yet is also handed back. Callers that must not overlap with
    /// it await [`PreviousRun::wait_finished`].
    pub fn start_or_replace(self: &Arc<Self>, task_id: &str) -> (RunGuard, Option<PreviousRun>) {
        debug!(%task_id, "start_or_replace: called");
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);

        let (previous, replaced) = {
            let mut runs = self.lock();
            let replaced = runs.live.insert(
                task_id.to_string(),
                RunEntry {
                    run_id,
                    token: token.clone(),
                    pid: None,
                    finished: finished_rx,
                },
            );
            let draining = runs.draining.remove(task_id);
            match replaced {
                Some(old) => {
                    old.token.cancel();
                    if let Some(pid) = old.pid {
                        terminate(pid);
                    }
                    (Some(PreviousRun { finished: old.finished }), true)
                }
                None => (
                    draining.map(|d| PreviousRun { finished: d.finished }),
                    false,
                ),
            }
        };

        if replaced {
            info!(%task_id, run_id, "Replaced active run");
        }

        let guard = RunGuard {
            registry: Arc::clone(self),
            task_id: task_id.to_string(),
            run_id,
            token,
            finished: finished_tx,
        };
        (guard, previous)
    }

    /// Cancel the active run for `task_id`
    ///
    /// Sets the run's token, SIGTERMs its live process, and removes the entry.
    /// Returns false when nothing was running.
    pub fn cancel(&self, task_id: &str) -> bool {
        debug!(%task_id, "cancel: called");
        let entry = {
            let mut runs = self.lock();
            let Some(entry) = runs.live.remove(task_id) else {
                debug!(%task_id, "cancel: no active run");
                return false;
            };
            runs.draining.insert(
                task_id.to_string(),
                Draining {
                    run_id: entry.run_id,
                    finished: entry.finished.clone(),
                },
            );
            entry
        };

        entry.token.cancel();
        if let Some(pid) = entry.pid {
            terminate(pid);
        }
        info!(%task_id, run_id = entry.run_id, "Cancelled run");
        true
    }

    /// Whether a run is registered for `task_id`
    pub fn is_active(&self, task_id: &str) -> bool {
        self.lock().live.contains_key(task_id)
    }

    /// Number of registered runs
    pub fn active_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Ids of every registered run
    pub fn active_task_ids(&self) -> Vec<String> {
        self.lock().live.keys().cloned().collect()
    }

    /// Cancel every registered run
    pub fn cancel_all(&self) -> usize {
        let ids = self.active_task_ids();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    fn set_pid(&self, task_id: &str, run_id: u64, pid: Option<u32>) {
        let mut runs = self.lock();
        match runs.live.get_mut(task_id) {
            Some(entry) if entry.run_id == run_id => entry.pid = pid,
            _ => {
                // Replaced or cancelled already; the run's token is set and
                // the runner kills the child itself.
                debug!(%task_id, run_id, "set_pid: run no longer registered");
            }
        }
    }

    fn release(&self, task_id: &str, run_id: u64) {
        let mut runs = self.lock();
        if runs.live.get(task_id).is_some_and(|entry| entry.run_id == run_id) {
            runs.live.remove(task_id);
            debug!(%task_id, run_id, "release: entry removed");
        }
        if runs.draining.get(task_id).is_some_and(|d| d.run_id == run_id) {
            runs.draining.remove(task_id);
            debug!(%task_id, run_id, "release: draining entry removed");
        }
    }

    #[cfg(test)]
    fn draining_count(&self) -> usize {
        self.lock().draining.len()
    }
}

/// Send SIGTERM to an agent and its process group
///
/// Agents are spawned as group leaders, so the signal also reaches the tools
/// they started. Processes that are already gone are ignored.
pub(crate) fn terminate(pid: u32) {
    debug!(pid, "terminate: sending SIGTERM");
    signal_group(pid, Signal::SIGTERM);
}

/// Send SIGKILL to an agent's whole process group
pub(crate) fn kill_group(pid: u32) {
    debug!(pid, "kill_group: sending SIGKILL");
    signal_group(pid, Signal::SIGKILL);
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "signal_group: pid out of range");
        return;
    };
    let pid_t = Pid::from_raw(raw);
    if killpg(pid_t, signal).is_ok() {
        return;
    }
    if let Err(e) = kill(pid_t, signal) {
        debug!(pid, ?signal, error = %e, "signal_group: kill failed (process likely gone)");
    }
}

/// Ownership of one registered run
///
/// Dropping the guard unregisters the run (if it is still the registered one)
/// and signals anyone waiting on its [`PreviousRun`].
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    task_id: String,
    run_id: u64,
    token: CancellationToken,
    finished: watch::Sender<bool>,
}

impl RunGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Token cancelled by `cancel` or by a replacing run
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record the live process so external cancellation can signal it
    pub fn attach_pid(&self, pid: u32) {
        debug!(task_id = %self.task_id, pid, "attach_pid: called");
        self.registry.set_pid(&self.task_id, self.run_id, Some(pid));
    }

    /// Forget the process once it has exited
    pub fn detach_pid(&self) {
        self.registry.set_pid(&self.task_id, self.run_id, None);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release(&self.task_id, self.run_id);
        let _ = self.finished.send(true);
    }
}

/// Handle on a run that was replaced by a newer one
pub struct PreviousRun {
    finished: watch::Receiver<bool>,
}

impl PreviousRun {
    /// Whether the replaced run has already finished
    pub fn finished_now(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until the replaced run has dropped its guard
    ///
    /// Returns false if it did not finish within `timeout`.
    pub async fn wait_finished(mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.finished.wait_for(|done| *done)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(?timeout, "wait_finished: previous run still finishing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_start_and_release() {
        let registry = Arc::new(RunRegistry::new());
        let (guard, previous) = registry.start_or_replace("t1");
        assert!(previous.is_none());
        assert!(registry.is_active("t1"));
        assert_eq!(guard.task_id(), "t1");

        drop(guard);
        assert!(!registry.is_active("t1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_replace_cancels_previous_token() {
        let registry = Arc::new(RunRegistry::new());
        let (first, _) = registry.start_or_replace("t1");
        let (second, previous) = registry.start_or_replace("t1");

        assert!(previous.is_some());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.active_count(), 1);

        // Old guard must not evict the new run
        drop(first);
        assert!(registry.is_active("t1"));
        drop(second);
        assert!(!registry.is_active("t1"));
    }

    #[test]
    fn test_cancel() {
        let registry = Arc::new(RunRegistry::new());
        assert!(!registry.cancel("none"));

        let (guard, _) = registry.start_or_replace("t1");
        assert!(registry.cancel("t1"));
        assert!(guard.is_cancelled());
        assert!(!registry.is_active("t1"));
        assert!(!registry.cancel("t1"));
    }

    #[test]
    fn test_independent_tasks() {
        let registry = Arc::new(RunRegistry::new());
        let (a, _) = registry.start_or_replace("a");
        let (b, _) = registry.start_or_replace("b");

        assert!(registry.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(registry.is_active("b"));
    }

    #[test]
    fn test_cancel_all() {
        let registry = Arc::new(RunRegistry::new());
        let (a, _) = registry.start_or_replace("a");
        let (b, _) = registry.start_or_replace("b");

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_finished_resolves_on_drop() {
        let registry = Arc::new(RunRegistry::new());
        let (first, _) = registry.start_or_replace("t1");
        let (_second, previous) = registry.start_or_replace("t1");
        let previous = previous.unwrap();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
        });

        assert!(previous.wait_finished(Duration::from_secs(2)).await);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_cancel_waits_for_cancelled_run() {
        let registry = Arc::new(RunRegistry::new());
        let (first, _) = registry.start_or_replace("t1");
        assert!(registry.cancel("t1"));
        assert!(!registry.is_active("t1"));

        let (_second, previous) = registry.start_or_replace("t1");
        let previous = previous.expect("cancelled run still draining");
        assert!(!previous.finished_now());

        drop(first);
        assert!(previous.wait_finished(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_restart_after_cancelled_run_finished_has_no_previous() {
        let registry = Arc::new(RunRegistry::new());
        let (first, _) = registry.start_or_replace("t1");
        assert!(registry.cancel("t1"));
        drop(first);

        let (_second, previous) = registry.start_or_replace("t1");
        assert!(previous.is_none());
    }

    #[test]
    fn test_cancelled_runs_do_not_accumulate() {
        let registry = Arc::new(RunRegistry::new());
        for i in 0..50 {
            let id = format!("task-{}", i);
            let (guard, _) = registry.start_or_replace(&id);
            assert!(registry.cancel(&id));
            assert_eq!(registry.draining_count(), 1);
            drop(guard);
            assert_eq!(registry.draining_count(), 0);
        }
    }

    #[test]
    fn test_stale_guard_keeps_newer_draining_entry() {
        let registry = Arc::new(RunRegistry::new());
        let (first, _) = registry.start_or_replace("t1");
        let (second, _) = registry.start_or_replace("t1");
        assert!(registry.cancel("t1"));

        // The replaced run finishing must not forget the cancelled one
        drop(first);
        assert_eq!(registry.draining_count(), 1);
        let (_third, previous) = registry.start_or_replace("t1");
        assert!(!previous.expect("second run still draining").finished_now());
        drop(second);
    }

    #[tokio::test]
    async fn test_wait_finished_times_out() {
        let registry = Arc::new(RunRegistry::new());
        let (_first, _) = registry.start_or_replace("t1");
        let (_second, previous) = registry.start_or_replace("t1");

        assert!(!previous.unwrap().wait_finished(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_concurrent_starts_leave_one_entry() {
        let registry = Arc::new(RunRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (guard, _) = registry.start_or_replace("shared");
                assert!(registry.active_count() <= 1);
                guard
            }));
        }

        let mut guards = Vec::new();
        for handle in handles {
            guards.push(handle.await.unwrap());
        }

        assert_eq!(registry.active_count(), 1);
        assert_eq!(guards.iter().filter(|g| !g.is_cancelled()).count(), 1);

        drop(guards);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_stale_attach_pid_ignored() {
        let registry = Arc::new(RunRegistry::new());
        let (first, _) = registry.start_or_replace("t1");
        let (_second, _) = registry.start_or_replace("t1");

        // The replaced run must not overwrite the live entry's pid
        first.attach_pid(u32::MAX);
        assert!(registry.cancel("t1"));
    }

    proptest! {
        #[test]
        fn prop_at_most_one_entry_per_task(ops in proptest::collection::vec((0u8..4, 0usize..3), 1..40)) {
            let registry = Arc::new(RunRegistry::new());
            let ids = ["a", "b", "c"];
            let mut guards: Vec<RunGuard> = Vec::new();

            for (op, idx) in ops {
                let id = ids[idx];
                match op {
                    0 | 1 => {
                        let (guard, _) = registry.start_or_replace(id);
                        guards.push(guard);
                    }
                    2 => {
                        registry.cancel(id);
                    }
                    _ => {
                        if let Some(pos) = guards.iter().position(|g| g.task_id() == id) {
                            guards.remove(pos);
                        }
                    }
                }

                let live: Vec<&RunGuard> = guards.iter().filter(|g| !g.is_cancelled()).collect();
                for id in ids {
                    let live_for_id = live.iter().filter(|g| g.task_id() == id).count();
                    prop_assert!(live_for_id <= 1);
                    prop_assert_eq!(registry.is_active(id), live_for_id == 1);
                }
            }
        }
    }
}
