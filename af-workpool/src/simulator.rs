//! In-memory virtualization backend.
//!
//! Used by the daemon's `simulator` backend and by tests. Provisioning can be
//! held and released step by step, and failures can be injected per operation.

use crate::backend::{
    CloneRequest, InstallRequest, PowerState, ProvisionResult, Provisioner, SnapshotInfo,
    VcManager, VirtualMachine,
};
use crate::error::{Result, WorkpoolError};
use crate::model::VcConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Clone)]
struct SimulatedVm {
    name: String,
    power: PowerState,
    snapshots: Vec<SnapshotInfo>,
    current_snapshot: Option<String>,
}

#[derive(Debug, Default)]
struct SimulatorState {
    vms: HashMap<String, SimulatedVm>,
    next_moid: u64,
    clones_started: usize,
    installs_started: usize,
    destroys: usize,
    power_offs: usize,
    screen_changes: usize,
    provision_gate: Option<Arc<Semaphore>>,
    provision_failures: Vec<String>,
    destroy_failure: Option<String>,
    missing_tools: bool,
    tools_gate: Option<Arc<Semaphore>>,
}

impl SimulatorState {
    fn create_vm(&mut self, name: &str) -> String {
        self.next_moid += 1;
        let moid = format!("vm-{}", self.next_moid);
        self.vms.insert(
            moid.clone(),
            SimulatedVm {
                name: name.to_string(),
                power: PowerState::PoweredOff,
                snapshots: Vec::new(),
                current_snapshot: None,
            },
        );
        moid
    }
}

#[derive(Clone, Default)]
pub struct Simulator {
    state: Arc<Mutex<SimulatorState>>,
    config: VcConfig,
}

impl Simulator {
    pub fn new(config: VcConfig) -> Self {
        Self {
            state: Arc::default(),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a VM as if it already existed in the inventory.
    pub fn add_vm(&self, name: &str) -> String {
        self.lock().create_vm(name)
    }

    /// Make a VM vanish behind the pool's back.
    pub fn remove_vm(&self, moid: &str) {
        self.lock().vms.remove(moid);
    }

    pub fn vm_exists(&self, moid: &str) -> bool {
        self.lock().vms.contains_key(moid)
    }

    pub fn vm_count(&self) -> usize {
        self.lock().vms.len()
    }

    pub fn vm_name(&self, moid: &str) -> Option<String> {
        self.lock().vms.get(moid).map(|vm| vm.name.clone())
    }

    pub fn power_state_of(&self, moid: &str) -> Option<PowerState> {
        self.lock().vms.get(moid).map(|vm| vm.power)
    }

    pub fn set_power_state(&self, moid: &str, power: PowerState) {
        if let Some(vm) = self.lock().vms.get_mut(moid) {
            vm.power = power;
        }
    }

    pub fn snapshot_names(&self, moid: &str) -> Vec<String> {
        self.lock()
            .vms
            .get(moid)
            .map(|vm| vm.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clones_started(&self) -> usize {
        self.lock().clones_started
    }

    pub fn installs_started(&self) -> usize {
        self.lock().installs_started
    }

    pub fn destroys(&self) -> usize {
        self.lock().destroys
    }

    pub fn power_offs(&self) -> usize {
        self.lock().power_offs
    }

    pub fn screen_changes(&self) -> usize {
        self.lock().screen_changes
    }

    /// Park every provisioning job until [`Simulator::release_provisioning`] lets it through.
    pub fn hold_provisioning(&self) {
        self.lock().provision_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_provisioning(&self, jobs: usize) {
        if let Some(gate) = &self.lock().provision_gate {
            gate.add_permits(jobs);
        }
    }

    /// The next provisioning job fails with `message`.
    pub fn fail_next_provision(&self, message: &str) {
        self.lock().provision_failures.push(message.to_string());
    }

    /// Every destroy fails with `message` until cleared with `None`.
    pub fn fail_destroys(&self, message: Option<&str>) {
        self.lock().destroy_failure = message.map(str::to_string);
    }

    /// Guests never report running tools.
    pub fn break_tools(&self) {
        self.lock().missing_tools = true;
    }

    /// Waits for guest tools block until [`Simulator::release_tools`].
    pub fn hold_tools(&self) {
        self.lock().tools_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_tools(&self) {
        if let Some(gate) = self.lock().tools_gate.take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    async fn provision(&self, name: &str) -> Result<ProvisionResult> {
        let gate = self.lock().provision_gate.clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.lock();
        if !state.provision_failures.is_empty() {
            let message = state.provision_failures.remove(0);
            return Err(WorkpoolError::Backend(message));
        }
        let moid = state.create_vm(name);
        debug!("Simulator provisioned {} as {}", name, moid);
        Ok(ProvisionResult { moid })
    }
}

#[async_trait]
impl VcManager for Simulator {
    fn config(&self) -> VcConfig {
        self.config.clone()
    }

    async fn vm(&self, moid: &str) -> Result<Arc<dyn VirtualMachine>> {
        Ok(Arc::new(SimulatorVm {
            simulator: self.clone(),
            moid: moid.to_string(),
        }))
    }
}

#[async_trait]
impl Provisioner for Simulator {
    async fn clone_vm(&self, request: CloneRequest) -> Result<ProvisionResult> {
        {
            let mut state = self.lock();
            state.clones_started += 1;
            let source = request.vm_image.moid.as_deref().unwrap_or_default();
            let has_base = state
                .vms
                .get(source)
                .is_some_and(|vm| vm.snapshots.iter().any(|s| s.name == crate::model::CLONING_SNAPSHOT));
            if !has_base {
                return Err(WorkpoolError::Backend(format!(
                    "Source VM {} has no cloning snapshot",
                    source
                )));
            }
        }
        self.provision(&request.vm_name).await
    }

    async fn install_vm(&self, request: InstallRequest) -> Result<ProvisionResult> {
        self.lock().installs_started += 1;
        self.provision(&request.vm_name).await
    }
}

struct SimulatorVm {
    simulator: Simulator,
    moid: String,
}

impl SimulatorVm {
    fn with_vm<T>(&self, f: impl FnOnce(&mut SimulatedVm) -> T) -> Result<T> {
        let mut state = self.simulator.lock();
        state
            .vms
            .get_mut(&self.moid)
            .map(f)
            .ok_or_else(|| WorkpoolError::Backend(format!("VM {} does not exist", self.moid)))
    }
}

#[async_trait]
impl VirtualMachine for SimulatorVm {
    fn moid(&self) -> &str {
        &self.moid
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.simulator.vm_exists(&self.moid))
    }

    async fn power_on(&self) -> Result<()> {
        self.with_vm(|vm| vm.power = PowerState::PoweredOn)
    }

    async fn power_off(&self) -> Result<()> {
        self.with_vm(|vm| vm.power = PowerState::PoweredOff)?;
        self.simulator.lock().power_offs += 1;
        Ok(())
    }

    async fn power_state(&self) -> Result<PowerState> {
        self.with_vm(|vm| vm.power)
    }

    async fn wait_for_tools(&self) -> Result<()> {
        let gate = self.simulator.lock().tools_gate.clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        if self.simulator.lock().missing_tools {
            return Err(WorkpoolError::Backend("Guest tools are not running".to_string()));
        }
        self.with_vm(|_| ())
    }

    async fn wait_for_guest_ip(&self) -> Result<String> {
        let suffix = self.moid.trim_start_matches("vm-").parse::<u8>().unwrap_or(1);
        self.with_vm(|_| format!("10.0.0.{}", suffix))
    }

    async fn set_screen_resolution(&self, _width: u32, _height: u32) -> Result<()> {
        self.with_vm(|_| ())?;
        self.simulator.lock().screen_changes += 1;
        Ok(())
    }

    async fn find_snapshot(&self, name: &str) -> Result<Option<SnapshotInfo>> {
        self.with_vm(|vm| vm.snapshots.iter().find(|s| s.name == name).cloned())
    }

    async fn create_snapshot(&self, name: &str, description: &str) -> Result<()> {
        self.with_vm(|vm| {
            vm.snapshots.push(SnapshotInfo {
                name: name.to_string(),
                description: description.to_string(),
            });
            vm.current_snapshot = Some(name.to_string());
        })
    }

    async fn current_snapshot(&self) -> Result<Option<SnapshotInfo>> {
        self.with_vm(|vm| {
            vm.current_snapshot
                .as_ref()
                .and_then(|name| vm.snapshots.iter().find(|s| &s.name == name).cloned())
        })
    }

    async fn revert_to_snapshot(&self, name: &str) -> Result<()> {
        self.with_vm(|vm| {
            if vm.snapshots.iter().any(|s| s.name == name) {
                vm.current_snapshot = Some(name.to_string());
                vm.power = PowerState::PoweredOff;
                Ok(())
            } else {
                Err(WorkpoolError::Backend(format!("Snapshot {} not found", name)))
            }
        })?
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.simulator.lock();
        if let Some(message) = state.destroy_failure.clone() {
            return Err(WorkpoolError::Backend(message));
        }
        if state.vms.remove(&self.moid).is_none() {
            return Err(WorkpoolError::Backend(format!("VM {} does not exist", self.moid)));
        }
        state.destroys += 1;
        Ok(())
    }
}
