//! Persisted models for workpools, their instances and leases, and VM images.
//!
//! Models are plain data. The actors in [`crate::workpool`] and [`crate::vm_image`]
//! own the live copy and write it back through [`crate::repository::Repository`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Snapshot name every clone is taken from.
pub const CLONING_SNAPSHOT: &str = "ThinApp Cloning Snapshot";

/// Snapshot taken right after an install instancer finishes a fresh VM.
pub const CLEAN_SNAPSHOT: &str = "ThinApp Clean Snapshot";

/// Guest account of cloned VMs and of XP installs.
pub const GUEST_USERNAME: &str = "Administrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum WorkpoolState {
    Created,
    Available,
    Unavailable,
    WaitingForInstancer,
    Resetting,
    Deleting,
    Deleted,
    DeleteFailed,
}

impl WorkpoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::WaitingForInstancer => "waitingForInstancer",
            Self::Resetting => "resetting",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "deleteFailed",
        }
    }

    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Available
                | Self::Unavailable
                | Self::WaitingForInstancer
                | Self::DeleteFailed
        )
    }

    /// States the instancer is allowed to move the pool between.
    pub fn is_steady(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Available | Self::Unavailable | Self::WaitingForInstancer
        )
    }

    /// State to resume in after a restart interrupted an operation.
    pub fn failed_state_or_self(self) -> Self {
        match self {
            Self::Deleting => Self::DeleteFailed,
            other => other,
        }
    }
}

impl fmt::Display for WorkpoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    Created,
    Instancing,
    Available,
    Deleting,
    InstancingFailed,
    DeleteFailed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Instancing => "instancing",
            Self::Available => "available",
            Self::Deleting => "deleting",
            Self::InstancingFailed => "instancingFailed",
            Self::DeleteFailed => "deleteFailed",
        }
    }

    pub fn failed_state_or_self(self) -> Self {
        match self {
            Self::Instancing => Self::InstancingFailed,
            Self::Deleting => Self::DeleteFailed,
            other => other,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::InstancingFailed | Self::DeleteFailed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum VmImageState {
    Unknown,
    Created,
    Available,
    VmDoesNotExist,
    Installing,
    InstallFailed,
    InstallFinished,
    CreatingBaseSnapshot,
    Snapshotted,
    SnapshotFailed,
    WaitingImport,
    WaitingInstall,
    DeleteRequested,
    Deleting,
    Deleted,
    DeleteFailed,
}

impl VmImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Created => "created",
            Self::Available => "available",
            Self::VmDoesNotExist => "vmDoesNotExist",
            Self::Installing => "installing",
            Self::InstallFailed => "installFailed",
            Self::InstallFinished => "installFinished",
            Self::CreatingBaseSnapshot => "creatingBaseSnapshot",
            Self::Snapshotted => "snapshotted",
            Self::SnapshotFailed => "snapshotFailed",
            Self::WaitingImport => "waitingImport",
            Self::WaitingInstall => "waitingInstall",
            Self::DeleteRequested => "deleteRequested",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "deleteFailed",
        }
    }

    pub fn is_deletable(&self) -> bool {
        matches!(
            self,
            Self::Unknown
                | Self::Created
                | Self::Available
                | Self::VmDoesNotExist
                | Self::InstallFailed
                | Self::InstallFinished
                | Self::Snapshotted
                | Self::SnapshotFailed
                | Self::WaitingImport
                | Self::WaitingInstall
                | Self::DeleteFailed
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::VmDoesNotExist | Self::InstallFailed | Self::SnapshotFailed | Self::DeleteFailed
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn failed_state_or_self(self) -> Self {
        match self {
            Self::Installing => Self::InstallFailed,
            Self::CreatingBaseSnapshot => Self::SnapshotFailed,
            Self::Deleting => Self::DeleteFailed,
            other => other,
        }
    }
}

impl fmt::Display for VmImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OsType {
    WinXpPro,
    WinVista,
    Win7,
    Win8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    pub os_type: OsType,
    /// Edition within the OS family, e.g. `enterprise`. Empty for XP.
    #[serde(default)]
    pub variant: String,
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsRegistration {
    pub user_name: String,
    pub organization: String,
    #[serde(default)]
    pub product_key: String,
}

impl fmt::Debug for OsRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsRegistration")
            .field("user_name", &self.user_name)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

/// Recipe for installing a VM from media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPattern {
    pub os_info: OsInfo,
    pub os_registration: OsRegistration,
    pub iso_path: String,
    #[serde(default)]
    pub network_name: String,
}

impl VmPattern {
    /// Account the installed guest logs in with.
    pub fn guest_username(&self) -> &str {
        match self.os_info.os_type {
            OsType::WinXpPro => GUEST_USERNAME,
            _ => &self.os_registration.user_name,
        }
    }
}

/// Where new VMs are placed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmLocation {
    pub compute_resource: String,
    pub datastore_name: String,
    pub resource_pool: String,
}

/// Connection details of the virtualization backend, snapshotted onto each lease.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcConfig {
    pub host: String,
    pub datacenter: String,
    pub username: String,
    pub password: String,
    pub vm_location: VmLocation,
}

impl fmt::Debug for VcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VcConfig")
            .field("host", &self.host)
            .field("datacenter", &self.datacenter)
            .field("username", &self.username)
            .field("vm_location", &self.vm_location)
            .finish_non_exhaustive()
    }
}

/// How a workpool obtains new instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkpoolKind {
    /// Linked clones of a managed VM image.
    #[serde(rename_all = "camelCase")]
    Clone { vm_image_id: String },
    /// Fresh installs from a pattern.
    Install { pattern: VmPattern },
    /// Instances registered by an administrator; the pool never grows itself.
    Custom,
}

/// How a workpool or image deletion treats the VMs behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeleteMethod {
    /// Destroy the VMs.
    DeleteFromDisk,
    /// Stop tracking the VMs and leave them alone.
    RemoveFromInventory,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceModel {
    pub id: String,
    pub workpool_id: String,
    pub moid: Option<String>,
    pub guest_username: String,
    pub guest_password: String,
    pub autologon: bool,
    pub state: InstanceState,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

impl InstanceModel {
    pub fn new(workpool_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workpool_id: workpool_id.to_string(),
            moid: None,
            guest_username: String::new(),
            guest_password: String::new(),
            autologon: false,
            state: InstanceState::Created,
            last_error: String::new(),
            created_at: Utc::now(),
        }
    }

    /// An instance for an existing VM, as registered on custom pools.
    pub fn existing(moid: &str, guest_username: &str, guest_password: &str, autologon: bool) -> Self {
        let mut instance = Self::new("");
        instance.moid = Some(moid.to_string());
        instance.guest_username = guest_username.to_string();
        instance.guest_password = guest_password.to_string();
        instance.autologon = autologon;
        instance
    }
}

impl fmt::Debug for InstanceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceModel")
            .field("id", &self.id)
            .field("moid", &self.moid)
            .field("guest_username", &self.guest_username)
            .field("autologon", &self.autologon)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// Grant of exclusive use of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseModel {
    pub id: String,
    pub instance: InstanceModel,
    pub vc_config: VcConfig,
}

impl LeaseModel {
    pub fn new(instance: InstanceModel, vc_config: VcConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            instance,
            vc_config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkpoolModel {
    pub id: String,
    pub name: String,
    pub kind: WorkpoolKind,
    pub maximum_instances: i32,
    pub state: WorkpoolState,
    pub last_error: String,
    /// Creation order; free instances are handed out front to back.
    pub instances: Vec<InstanceModel>,
    pub leases: Vec<LeaseModel>,
    pub created_at: DateTime<Utc>,
}

impl WorkpoolModel {
    pub fn new(name: &str, kind: WorkpoolKind, maximum_instances: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            maximum_instances,
            state: WorkpoolState::Created,
            last_error: String::new(),
            instances: Vec::new(),
            leases: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether the pool may create instances on demand.
    pub fn is_growable(&self) -> bool {
        !matches!(self.kind, WorkpoolKind::Custom)
    }

    pub fn capacity(&self) -> usize {
        self.maximum_instances.max(0) as usize
    }

    pub fn is_leased(&self, instance_id: &str) -> bool {
        self.leases.iter().any(|l| l.instance.id == instance_id)
    }

    /// Available instances with no lease on them, in pool order.
    pub fn free_instances(&self) -> Vec<&InstanceModel> {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Available && !self.is_leased(&i.id))
            .collect()
    }

    pub fn instance(&self, instance_id: &str) -> Option<&InstanceModel> {
        self.instances.iter().find(|i| i.id == instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: &str) -> Option<&mut InstanceModel> {
        self.instances.iter_mut().find(|i| i.id == instance_id)
    }

    /// Drop an instance and any lease on it.
    pub fn remove_instance(&mut self, instance_id: &str) -> Option<InstanceModel> {
        let position = self.instances.iter().position(|i| i.id == instance_id)?;
        self.leases.retain(|l| l.instance.id != instance_id);
        Some(self.instances.remove(position))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmImageModel {
    pub id: String,
    pub name: String,
    /// Set for imported images and once an install finishes.
    pub moid: Option<String>,
    pub os_info: OsInfo,
    pub os_registration: OsRegistration,
    /// Present when the image is to be installed rather than imported.
    pub vm_pattern: Option<VmPattern>,
    pub state: VmImageState,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

impl VmImageModel {
    /// An image backed by a VM that already exists.
    pub fn imported(name: &str, moid: &str, os_info: OsInfo, os_registration: OsRegistration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            moid: Some(moid.to_string()),
            os_info,
            os_registration,
            vm_pattern: None,
            state: VmImageState::Created,
            last_error: String::new(),
            created_at: Utc::now(),
        }
    }

    /// An image whose VM is installed from `pattern`.
    pub fn installed(name: &str, pattern: VmPattern) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            moid: None,
            os_info: pattern.os_info.clone(),
            os_registration: pattern.os_registration.clone(),
            vm_pattern: Some(pattern),
            state: VmImageState::Created,
            last_error: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_vm(&self) -> bool {
        self.moid.as_deref().is_some_and(|m| !m.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(pool: &WorkpoolModel, state: InstanceState) -> InstanceModel {
        let mut instance = InstanceModel::new(&pool.id);
        instance.state = state;
        instance
    }

    #[test]
    fn free_instances_skip_leased_and_busy() {
        let mut pool = WorkpoolModel::new("pool", WorkpoolKind::Custom, 3);
        let leased = instance(&pool, InstanceState::Available);
        let busy = instance(&pool, InstanceState::Instancing);
        let free = instance(&pool, InstanceState::Available);
        pool.leases.push(LeaseModel::new(leased.clone(), VcConfig::default()));
        pool.instances = vec![leased, busy, free.clone()];

        let ids: Vec<_> = pool.free_instances().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![free.id]);
    }

    #[test]
    fn removing_an_instance_drops_its_lease() {
        let mut pool = WorkpoolModel::new("pool", WorkpoolKind::Custom, 1);
        let leased = instance(&pool, InstanceState::Available);
        pool.leases.push(LeaseModel::new(leased.clone(), VcConfig::default()));
        pool.instances.push(leased.clone());

        assert!(pool.remove_instance(&leased.id).is_some());
        assert!(pool.leases.is_empty());
        assert!(pool.remove_instance(&leased.id).is_none());
    }

    #[test]
    fn only_custom_pools_are_fixed() {
        assert!(!WorkpoolModel::new("c", WorkpoolKind::Custom, 1).is_growable());
        let clone = WorkpoolKind::Clone {
            vm_image_id: "image".to_string(),
        };
        assert!(WorkpoolModel::new("c", clone, 1).is_growable());
    }

    #[test]
    fn interrupted_states_become_failures() {
        assert_eq!(WorkpoolState::Deleting.failed_state_or_self(), WorkpoolState::DeleteFailed);
        assert_eq!(WorkpoolState::Available.failed_state_or_self(), WorkpoolState::Available);
        assert_eq!(
            InstanceState::Instancing.failed_state_or_self(),
            InstanceState::InstancingFailed
        );
        assert_eq!(
            VmImageState::CreatingBaseSnapshot.failed_state_or_self(),
            VmImageState::SnapshotFailed
        );
        assert_eq!(VmImageState::Installing.failed_state_or_self(), VmImageState::InstallFailed);
    }

    #[test]
    fn image_state_classes() {
        assert!(VmImageState::Available.is_ready());
        assert!(VmImageState::VmDoesNotExist.is_failure());
        assert!(!VmImageState::Installing.is_deletable());
        assert!(VmImageState::SnapshotFailed.is_deletable());
        assert!(!WorkpoolState::Resetting.is_deletable());
    }

    #[test]
    fn xp_installs_use_the_builtin_account() {
        let mut pattern = VmPattern {
            os_info: OsInfo {
                os_type: OsType::WinXpPro,
                variant: String::new(),
            },
            os_registration: OsRegistration {
                user_name: "packager".to_string(),
                organization: "Example".to_string(),
                product_key: String::new(),
            },
            iso_path: "[ds] xp.iso".to_string(),
            network_name: String::new(),
        };
        assert_eq!(pattern.guest_username(), GUEST_USERNAME);

        pattern.os_info.os_type = OsType::Win7;
        assert_eq!(pattern.guest_username(), "packager");
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let config = VcConfig {
            password: "hunter2".to_string(),
            ..VcConfig::default()
        };
        let mut instance = InstanceModel::new("pool");
        instance.guest_password = "swordfish".to_string();

        assert!(!format!("{:?}", config).contains("hunter2"));
        assert!(!format!("{:?}", instance).contains("swordfish"));
    }
}
