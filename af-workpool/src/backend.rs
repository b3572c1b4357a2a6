//! Virtualization backend capabilities.
//!
//! The pool logic only talks to VMs through these traits. `simulator` provides an
//! in-memory implementation; a vCenter-backed one plugs in the same way.

use crate::error::Result;
use crate::model::{VcConfig, VmImageModel, VmLocation, VmPattern};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub description: String,
}

/// Operations on one VM, addressed by its managed object id.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    fn moid(&self) -> &str;

    async fn exists(&self) -> Result<bool>;

    async fn power_on(&self) -> Result<()>;

    async fn power_off(&self) -> Result<()>;

    async fn power_state(&self) -> Result<PowerState>;

    /// Resolves once the guest tools report running.
    async fn wait_for_tools(&self) -> Result<()>;

    /// Resolves with the guest's IP address once it has one.
    async fn wait_for_guest_ip(&self) -> Result<String>;

    async fn set_screen_resolution(&self, width: u32, height: u32) -> Result<()>;

    async fn find_snapshot(&self, name: &str) -> Result<Option<SnapshotInfo>>;

    async fn create_snapshot(&self, name: &str, description: &str) -> Result<()>;

    async fn current_snapshot(&self) -> Result<Option<SnapshotInfo>>;

    async fn revert_to_snapshot(&self, name: &str) -> Result<()>;

    /// Remove the VM from disk.
    async fn destroy(&self) -> Result<()>;
}

#[async_trait]
pub trait VcManager: Send + Sync {
    /// Connection details handed out with each lease.
    fn config(&self) -> VcConfig;

    async fn vm(&self, moid: &str) -> Result<Arc<dyn VirtualMachine>>;
}

#[derive(Debug, Clone)]
pub struct HardwareConfiguration {
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub num_cpus: u32,
}

impl Default for HardwareConfiguration {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            disk_mb: 20 * 1024,
            num_cpus: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub vm_name: String,
    pub vm_image: VmImageModel,
    pub vc_config: VcConfig,
    pub vm_location: VmLocation,
    pub guest_password: String,
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub vm_name: String,
    pub vm_pattern: VmPattern,
    pub hardware: HardwareConfiguration,
    pub vc_config: VcConfig,
    pub vm_location: VmLocation,
    pub guest_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub moid: String,
}

/// Runs the long clone/install jobs that produce new VMs.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn clone_vm(&self, request: CloneRequest) -> Result<ProvisionResult>;

    async fn install_vm(&self, request: InstallRequest) -> Result<ProvisionResult>;
}

/// Everything an actor needs to reach the outside world.
#[derive(Clone)]
pub struct Services {
    pub repository: crate::repository::Repository,
    pub vc: Arc<dyn VcManager>,
    pub provisioner: Arc<dyn Provisioner>,
    pub dispatcher: crate::dispatch::Dispatcher,
    /// Password set on guests this system provisions.
    pub guest_password: String,
}
