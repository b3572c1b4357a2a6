//! Kill switches for guest programs that block a capture.
//!
//! Guest commands run as host processes that can hang on I/O. Each one is
//! tracked under its capture's command id so a cancel from another task can
//! stop it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct Registry {
    running: Mutex<HashMap<i64, (u64, oneshot::Sender<()>)>>,
    next_token: AtomicU64,
}

#[derive(Clone, Default)]
pub struct ProcessMonitor {
    registry: Arc<Registry>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&self) -> MutexGuard<'_, HashMap<i64, (u64, oneshot::Sender<()>)>> {
        self.registry
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a process started for `command_id`, replacing any earlier one.
    pub fn track(&self, command_id: i64) -> TrackedProcess {
        let token = self.registry.next_token.fetch_add(1, Ordering::Relaxed);
        let (kill, killed) = oneshot::channel();
        self.running().insert(command_id, (token, kill));
        TrackedProcess {
            monitor: self.clone(),
            command_id,
            token,
            killed,
        }
    }

    /// Kill whatever is running for `command_id`. Returns whether anything was.
    pub fn cancel(&self, command_id: i64) -> bool {
        match self.running().remove(&command_id) {
            Some((_, kill)) => {
                debug!("Killing guest process for command {}", command_id);
                kill.send(()).is_ok()
            }
            None => false,
        }
    }

    pub fn is_tracking(&self, command_id: i64) -> bool {
        self.running().contains_key(&command_id)
    }
}

/// Registration of one running process. Dropping it stops tracking.
pub struct TrackedProcess {
    monitor: ProcessMonitor,
    command_id: i64,
    token: u64,
    killed: oneshot::Receiver<()>,
}

impl TrackedProcess {
    /// Resolves once the process has been cancelled.
    pub async fn killed(&mut self) {
        if (&mut self.killed).await.is_err() {
            // Replaced by a newer process for the same id; never fires.
            futures::future::pending::<()>().await;
        }
    }
}

impl Drop for TrackedProcess {
    fn drop(&mut self) {
        let mut running = self.monitor.running();
        if running
            .get(&self.command_id)
            .is_some_and(|(token, _)| *token == self.token)
        {
            running.remove(&self.command_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_fires_kill_switch() {
        let monitor = ProcessMonitor::new();
        let mut process = monitor.track(42);
        assert!(monitor.is_tracking(42));

        assert!(monitor.cancel(42));
        tokio::time::timeout(Duration::from_secs(1), process.killed())
            .await
            .expect("Kill switch did not fire");
        assert!(!monitor.is_tracking(42));
    }

    #[test]
    fn test_cancel_without_process_is_noop() {
        let monitor = ProcessMonitor::new();
        assert!(!monitor.cancel(1));
    }

    #[test]
    fn test_drop_stops_tracking() {
        let monitor = ProcessMonitor::new();
        let process = monitor.track(3);
        drop(process);
        assert!(!monitor.is_tracking(3));
        assert!(!monitor.cancel(3));
    }

    #[test]
    fn test_stale_registration_does_not_remove_newer_one() {
        let monitor = ProcessMonitor::new();
        let first = monitor.track(5);
        let _second = monitor.track(5);
        drop(first);
        assert!(monitor.is_tracking(5));
    }
}
