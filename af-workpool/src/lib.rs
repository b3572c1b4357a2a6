//! VM workpools
//!
//! This crate keeps pools of virtual machines that capture jobs lease one at a
//! time. A pool creates VMs on demand (by cloning a prepared VM image or by
//! installing from a pattern), destroys surplus ones, and survives restarts by
//! persisting its state to SQLite. Each workpool and each VM image runs as its
//! own tokio task; callers use the cloneable handles.

pub mod backend;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod instancer;
pub mod model;
pub mod repository;
pub mod simulator;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod vm_image;
pub mod vm_image_manager;
pub mod workpool;
pub mod workpool_manager;

pub use backend::{Provisioner, Services, VcManager, VirtualMachine};
pub use dispatch::Dispatcher;
pub use error::{Result, WorkpoolError};
pub use model::{
    DeleteMethod, InstanceModel, InstanceState, LeaseModel, VcConfig, VmImageModel, VmImageState,
    WorkpoolKind, WorkpoolModel, WorkpoolState,
};
pub use repository::Repository;
pub use vm_image::VmImageHandle;
pub use vm_image_manager::VmImageManager;
pub use workpool::{PendingLease, WorkpoolHandle, WorkpoolUpdate};
pub use workpool_manager::WorkpoolManager;
