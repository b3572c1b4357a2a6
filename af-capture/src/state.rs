//! Capture phases.
//!
//! Variants are declared in phase order and the derived `Ord` follows that
//! order, so the latest state of a run is the maximum of the states it entered.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum CaptureState {
    Created,
    AcquiringVm,
    VmAcquired,
    PoweringOnVm,
    WaitingForTools,
    NeedsLoginWait,
    NeedsLoginDone,
    InstallingThinApp,
    Downloading,
    InstallerDownloadFailed,
    MountingFileSharesToGuest,
    PreCaptureWait,
    PreCaptureDone,
    TakingPreCaptureSnapshot,
    PreInstallationWait,
    PreInstallationDone,
    InstallationWait,
    InstallationDone,
    PostInstallationWait,
    PostInstallationDone,
    TakingPostCaptureSnapshot,
    GeneratingProject,
    PreProjectBuildWait,
    PreProjectBuildDone,
    BuildingProject,
    RefreshingProject,
    RefreshingProjectDone,
    VmReleased,
    Cancelling,
    Failure,
    Success,
    Cancelled,
    Finished,
}

impl CaptureState {
    pub const ALL: [CaptureState; 33] = [
        Self::Created,
        Self::AcquiringVm,
        Self::VmAcquired,
        Self::PoweringOnVm,
        Self::WaitingForTools,
        Self::NeedsLoginWait,
        Self::NeedsLoginDone,
        Self::InstallingThinApp,
        Self::Downloading,
        Self::InstallerDownloadFailed,
        Self::MountingFileSharesToGuest,
        Self::PreCaptureWait,
        Self::PreCaptureDone,
        Self::TakingPreCaptureSnapshot,
        Self::PreInstallationWait,
        Self::PreInstallationDone,
        Self::InstallationWait,
        Self::InstallationDone,
        Self::PostInstallationWait,
        Self::PostInstallationDone,
        Self::TakingPostCaptureSnapshot,
        Self::GeneratingProject,
        Self::PreProjectBuildWait,
        Self::PreProjectBuildDone,
        Self::BuildingProject,
        Self::RefreshingProject,
        Self::RefreshingProjectDone,
        Self::VmReleased,
        Self::Cancelling,
        Self::Failure,
        Self::Success,
        Self::Cancelled,
        Self::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AcquiringVm => "acquiringVm",
            Self::VmAcquired => "vmAcquired",
            Self::PoweringOnVm => "poweringOnVm",
            Self::WaitingForTools => "waitingForTools",
            Self::NeedsLoginWait => "needsLoginWait",
            Self::NeedsLoginDone => "needsLoginDone",
            Self::InstallingThinApp => "installingThinApp",
            Self::Downloading => "downloading",
            Self::InstallerDownloadFailed => "installerDownloadFailed",
            Self::MountingFileSharesToGuest => "mountingFileSharesToGuest",
            Self::PreCaptureWait => "preCaptureWait",
            Self::PreCaptureDone => "preCaptureDone",
            Self::TakingPreCaptureSnapshot => "takingPreCaptureSnapshot",
            Self::PreInstallationWait => "preInstallationWait",
            Self::PreInstallationDone => "preInstallationDone",
            Self::InstallationWait => "installationWait",
            Self::InstallationDone => "installationDone",
            Self::PostInstallationWait => "postInstallationWait",
            Self::PostInstallationDone => "postInstallationDone",
            Self::TakingPostCaptureSnapshot => "takingPostCaptureSnapshot",
            Self::GeneratingProject => "generatingProject",
            Self::PreProjectBuildWait => "preProjectBuildWait",
            Self::PreProjectBuildDone => "preProjectBuildDone",
            Self::BuildingProject => "buildingProject",
            Self::RefreshingProject => "refreshingProject",
            Self::RefreshingProjectDone => "refreshingProjectDone",
            Self::VmReleased => "vmReleased",
            Self::Cancelling => "cancelling",
            Self::Failure => "failure",
            Self::Success => "success",
            Self::Cancelled => "cancelled",
            Self::Finished => "finished",
        }
    }

    /// States entered once the capture work itself is over.
    pub fn is_ending(&self) -> bool {
        *self >= Self::VmReleased
    }

    /// Progress estimate for a run whose latest state is `self`.
    pub fn percent(&self) -> u8 {
        match self {
            Self::Created => 5,
            Self::AcquiringVm => 10,
            Self::VmAcquired => 15,
            Self::PoweringOnVm => 20,
            Self::WaitingForTools => 25,
            Self::NeedsLoginWait => 30,
            Self::NeedsLoginDone | Self::InstallingThinApp => 35,
            Self::Downloading | Self::InstallerDownloadFailed | Self::MountingFileSharesToGuest => {
                40
            }
            Self::PreCaptureWait => 45,
            Self::PreCaptureDone | Self::TakingPreCaptureSnapshot => 50,
            Self::PreInstallationWait => 55,
            Self::PreInstallationDone | Self::InstallationWait => 60,
            Self::InstallationDone | Self::PostInstallationWait => 65,
            Self::PostInstallationDone | Self::TakingPostCaptureSnapshot => 70,
            Self::GeneratingProject => 75,
            Self::PreProjectBuildWait => 80,
            Self::PreProjectBuildDone | Self::BuildingProject => 85,
            Self::RefreshingProject => 90,
            Self::RefreshingProjectDone => 92,
            Self::VmReleased => 95,
            Self::Cancelling => 99,
            Self::Failure | Self::Success | Self::Cancelled | Self::Finished => 100,
        }
    }

    /// The state an external "next" moves a waiting capture to, if this is a
    /// state that waits on the user.
    pub fn next_done(&self) -> Option<CaptureState> {
        match self {
            Self::NeedsLoginWait => Some(Self::NeedsLoginDone),
            Self::PreCaptureWait => Some(Self::PreCaptureDone),
            Self::InstallationWait => Some(Self::InstallationDone),
            _ => None,
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
