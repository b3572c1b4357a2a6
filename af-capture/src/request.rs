//! One capture from lease to release.

use crate::capturer::Capturer;
use crate::error::{CaptureError, Result};
use crate::state::CaptureState;
use crate::status::Status;
use af_workpool::{LeaseModel, VcManager, VirtualMachine, WorkpoolHandle};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Taken when the VM has no current snapshot to return to.
pub const TEMPORARY_SNAPSHOT: &str = "AppFactory Capture Snapshot";

/// The project a capture produces, as known to the rest of the system.
#[async_trait]
pub trait Project: Send + Sync {
    fn id(&self) -> i64;

    /// Re-read the project from its output share after a build.
    async fn refresh(&self) -> Result<()>;
}

pub struct CaptureRequest {
    workpool: WorkpoolHandle,
    vc: Arc<dyn VcManager>,
    project: Arc<dyn Project>,
    capturer: Capturer,
    status: Status,
}

impl CaptureRequest {
    pub fn new(
        workpool: WorkpoolHandle,
        vc: Arc<dyn VcManager>,
        project: Arc<dyn Project>,
        capturer: Capturer,
    ) -> Self {
        let status = capturer.status().clone();
        Self {
            workpool,
            vc,
            project,
            capturer,
            status,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Run to completion. The status always ends in `finished`, and a
    /// lease that was granted is always returned.
    pub async fn run(mut self) -> Result<()> {
        self.status.set_project_id(self.project.id());
        self.status.set_current_state(CaptureState::AcquiringVm);

        let mut lease = None;
        let result = match self.capture(&mut lease).await {
            Ok(()) => Ok(()),
            Err(CaptureError::Canceled) => {
                info!("Capture request was canceled");
                self.status.set_current_state(CaptureState::Cancelled);
                Ok(())
            }
            Err(e) => {
                error!("Capture failed: {}", e);
                self.status.set_current_state(CaptureState::Failure);
                if self.status.last_error().is_empty() {
                    self.status.set_last_error(e.to_string());
                }
                Err(e)
            }
        };

        if let Some(lease) = lease {
            if let Err(e) = self.workpool.release(&lease).await {
                error!("Failed to release lease {}: {}", lease.id, e);
            }
        }
        self.status.set_current_state(CaptureState::VmReleased);
        self.capturer.cleanup_downloads().await;
        self.status.set_current_state(CaptureState::Finished);
        result
    }

    async fn capture(&mut self, granted: &mut Option<LeaseModel>) -> Result<()> {
        let acquire = self.workpool.acquire();
        let lease = tokio::select! {
            lease = acquire => lease?,
            _ = self.status.wait_until(CaptureState::Cancelling) => {
                return Err(CaptureError::Canceled);
            }
        };
        info!("Acquired instance {} from workpool {}", lease.instance.id, self.workpool.id());
        *granted = Some(lease.clone());

        let moid = lease.instance.moid.clone().ok_or_else(|| {
            CaptureError::InvalidState(format!("Leased instance {} has no VM", lease.instance.id))
        })?;
        let vm = self.vc.vm(&moid).await?;
        self.with_temporary_snapshot(vm.as_ref(), &lease).await?;

        self.status.set_current_state(CaptureState::RefreshingProject);
        self.project.refresh().await?;
        self.status
            .set_current_state(CaptureState::RefreshingProjectDone);
        self.status.set_current_state(CaptureState::Success);
        Ok(())
    }

    /// Run the capturer and put the VM back the way it was found.
    async fn with_temporary_snapshot(
        &mut self,
        vm: &dyn VirtualMachine,
        lease: &LeaseModel,
    ) -> Result<()> {
        let snapshot = match vm.current_snapshot().await? {
            Some(current) => current.name,
            None => {
                vm.create_snapshot(TEMPORARY_SNAPSHOT, "State before capture")
                    .await?;
                TEMPORARY_SNAPSHOT.to_string()
            }
        };

        let result = self.capturer.call(vm, lease).await;
        match vm.revert_to_snapshot(&snapshot).await {
            Ok(()) => result,
            Err(e) if result.is_ok() => Err(e.into()),
            Err(e) => {
                warn!("Failed to revert {} to {}: {}", vm.moid(), snapshot, e);
                result
            }
        }
    }
}
