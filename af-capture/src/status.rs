//! Observable progress of one capture run.
//!
//! A `Status` is shared between the task running the capture and whoever
//! controls it. States only accumulate: the current state is the highest one
//! entered, and `wait_until` blocks the capture until a controller moves it
//! forward or cancels.

use crate::command::Command;
use crate::state::CaptureState;
use af_workpool::LeaseModel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceData {
    pub refresh_rate: Option<u32>,
    pub date: DateTime<Utc>,
    pub values: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
struct Details {
    lease: Option<LeaseModel>,
    project_id: Option<i64>,
    refresh_rate: Option<u32>,
    perf_data: Option<PerformanceData>,
    last_command: Option<Command>,
    last_error: String,
}

/// Point-in-time copy of a status, as reported to controllers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub states: Vec<CaptureState>,
    pub current_state: CaptureState,
    pub percent: u8,
    pub lease: Option<LeaseModel>,
    pub project_id: Option<i64>,
    pub refresh_rate: Option<u32>,
    pub perf_data: Option<PerformanceData>,
    pub last_command: Option<Command>,
    pub last_error: String,
}

struct Inner {
    states: watch::Sender<BTreeSet<CaptureState>>,
    details: Mutex<Details>,
    poll_interval: Duration,
}

#[derive(Clone)]
pub struct Status {
    inner: Arc<Inner>,
}

impl Default for Status {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("states", &self.states())
            .finish_non_exhaustive()
    }
}

impl Status {
    /// A status in `created`. Waiters re-check every `poll_interval` even
    /// without a state change.
    pub fn new(poll_interval: Duration) -> Self {
        let (states, _) = watch::channel(BTreeSet::from([CaptureState::Created]));
        Self {
            inner: Arc::new(Inner {
                states,
                details: Mutex::new(Details::default()),
                poll_interval,
            }),
        }
    }

    fn details(&self) -> MutexGuard<'_, Details> {
        self.inner
            .details
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Every state entered so far, in phase order.
    pub fn states(&self) -> BTreeSet<CaptureState> {
        self.inner.states.borrow().clone()
    }

    pub fn contains(&self, state: CaptureState) -> bool {
        self.inner.states.borrow().contains(&state)
    }

    pub fn current_state(&self) -> CaptureState {
        self.inner
            .states
            .borrow()
            .last()
            .copied()
            .unwrap_or(CaptureState::Created)
    }

    /// Enter `state` and wake anyone waiting. Entering a state twice is a no-op.
    pub fn set_current_state(&self, state: CaptureState) {
        self.inner.states.send_if_modified(|states| states.insert(state));
    }

    pub fn percent(&self) -> u8 {
        self.current_state().percent()
    }

    /// Latest state entered before any ending state.
    pub fn last_running_state(&self) -> Option<CaptureState> {
        self.inner
            .states
            .borrow()
            .iter()
            .rev()
            .find(|s| !s.is_ending())
            .copied()
    }

    pub fn is_request_cancelling(&self) -> bool {
        self.contains(CaptureState::Cancelling)
    }

    pub fn is_request_cancelled(&self) -> bool {
        self.contains(CaptureState::Cancelled)
    }

    pub fn is_request_success(&self) -> bool {
        self.contains(CaptureState::Success)
    }

    pub fn is_finished(&self) -> bool {
        self.contains(CaptureState::Finished)
    }

    /// Wait until the run has reached `state` or a cancel was requested.
    /// Callers check for cancellation afterwards.
    pub async fn wait_until(&self, state: CaptureState) {
        let mut changes = self.inner.states.subscribe();
        loop {
            {
                let states = changes.borrow_and_update();
                let reached = states.last().is_some_and(|current| *current >= state);
                if reached || states.contains(&CaptureState::Cancelling) {
                    return;
                }
            }
            // The poll bound keeps waiters honest even if a wakeup is missed.
            let _ = tokio::time::timeout(self.inner.poll_interval, changes.changed()).await;
        }
    }

    pub fn lease(&self) -> Option<LeaseModel> {
        self.details().lease.clone()
    }

    pub fn set_lease(&self, lease: LeaseModel) {
        self.details().lease = Some(lease);
    }

    pub fn project_id(&self) -> Option<i64> {
        self.details().project_id
    }

    pub fn set_project_id(&self, project_id: i64) {
        self.details().project_id = Some(project_id);
    }

    pub fn refresh_rate(&self) -> Option<u32> {
        self.details().refresh_rate
    }

    pub fn set_refresh_rate(&self, refresh_rate: u32) {
        let mut details = self.details();
        details.refresh_rate = Some(refresh_rate);
        if let Some(perf) = details.perf_data.as_mut() {
            perf.refresh_rate = Some(refresh_rate);
        }
    }

    pub fn perf_data(&self) -> Option<PerformanceData> {
        self.details().perf_data.clone()
    }

    /// Record a performance sample taken at `date`.
    pub fn update_perf(&self, date: DateTime<Utc>, values: BTreeMap<String, i64>) {
        let mut details = self.details();
        details.perf_data = Some(PerformanceData {
            refresh_rate: details.refresh_rate,
            date,
            values,
        });
    }

    pub fn last_command(&self) -> Option<Command> {
        self.details().last_command.clone()
    }

    pub fn set_last_command(&self, command: Option<Command>) {
        self.details().last_command = command;
    }

    pub fn last_error(&self) -> String {
        self.details().last_error.clone()
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        self.details().last_error = error.into();
    }

    pub fn report(&self) -> StatusReport {
        let states = self.states();
        let current_state = states.last().copied().unwrap_or(CaptureState::Created);
        let details = self.details();
        StatusReport {
            states: states.into_iter().collect(),
            current_state,
            percent: current_state.percent(),
            lease: details.lease.clone(),
            project_id: details.project_id,
            refresh_rate: details.refresh_rate,
            perf_data: details.perf_data.clone(),
            last_command: details.last_command.clone(),
            last_error: details.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_created() {
        let status = Status::default();
        assert_eq!(status.current_state(), CaptureState::Created);
        assert_eq!(status.percent(), 5);
        assert_eq!(status.last_running_state(), Some(CaptureState::Created));
    }

    #[test]
    fn test_current_state_is_highest_entered() {
        let status = Status::default();
        status.set_current_state(CaptureState::InstallationWait);
        status.set_current_state(CaptureState::PreCaptureWait);
        assert_eq!(status.current_state(), CaptureState::InstallationWait);
        assert_eq!(status.states().len(), 3);
    }

    #[test]
    fn test_last_running_state_skips_ending_states() {
        let status = Status::default();
        status.set_current_state(CaptureState::BuildingProject);
        status.set_current_state(CaptureState::Failure);
        status.set_current_state(CaptureState::Finished);
        assert_eq!(status.current_state(), CaptureState::Finished);
        assert_eq!(status.last_running_state(), Some(CaptureState::BuildingProject));
    }

    #[test]
    fn test_refresh_rate_applies_to_perf_data() {
        let status = Status::default();
        status.update_perf(Utc::now(), BTreeMap::from([("cpu".to_string(), 12)]));
        assert_eq!(status.perf_data().and_then(|p| p.refresh_rate), None);

        status.set_refresh_rate(20);
        let perf = status.perf_data().expect("Missing perf data");
        assert_eq!(perf.refresh_rate, Some(20));
        assert_eq!(perf.values.get("cpu"), Some(&12));
    }

    #[test]
    fn test_report_matches_status() {
        let status = Status::default();
        status.set_project_id(7);
        status.set_current_state(CaptureState::AcquiringVm);
        status.set_last_error("boom");

        let report = status.report();
        assert_eq!(report.current_state, CaptureState::AcquiringVm);
        assert_eq!(report.percent, 10);
        assert_eq!(report.project_id, Some(7));
        assert_eq!(report.last_error, "boom");
        assert_eq!(
            report.states,
            vec![CaptureState::Created, CaptureState::AcquiringVm]
        );
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_state_change() {
        let status = Status::new(Duration::from_secs(60));
        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.wait_until(CaptureState::InstallationDone).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        status.set_current_state(CaptureState::InstallationDone);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("Waiter was not woken")
            .expect("Waiter panicked");
    }

    #[tokio::test]
    async fn test_wait_until_returns_on_cancel() {
        let status = Status::default();
        status.set_current_state(CaptureState::Cancelling);
        tokio::time::timeout(
            Duration::from_millis(100),
            status.wait_until(CaptureState::InstallationDone),
        )
        .await
        .expect("Cancelled status should not block");
    }

    #[tokio::test]
    async fn test_wait_until_returns_when_already_past() {
        let status = Status::default();
        status.set_current_state(CaptureState::PostInstallationWait);
        tokio::time::timeout(
            Duration::from_millis(100),
            status.wait_until(CaptureState::InstallationDone),
        )
        .await
        .expect("A later state satisfies the wait");
    }

    #[test]
    fn test_wait_until_cancelled_status_does_not_block() {
        let status = Status::default();
        status.set_current_state(CaptureState::Cancelling);
        tokio_test::block_on(status.wait_until(CaptureState::Finished));
        assert_eq!(status.current_state(), CaptureState::Cancelling);
    }
}
