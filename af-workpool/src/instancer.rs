//! Strategies a workpool uses to create new instances.
//!
//! An instancer publishes its own availability (a clone instancer is only
//! available while its VM image is) and, when asked, assigns guest credentials
//! to a new instance and hands back the provisioning job for the workpool to
//! dispatch.

use crate::backend::{CloneRequest, InstallRequest, ProvisionResult, Services};
use crate::error::{Result, WorkpoolError};
use crate::events::{StateChange, Subscribers, Subscription, SubscriptionId};
use crate::model::{InstanceModel, VmImageState, VmPattern, CLEAN_SNAPSHOT, GUEST_USERNAME};
use crate::vm_image::VmImageHandle;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancerState {
    Unavailable,
    Available,
    Failed,
}

/// Deferred provisioning job. Nothing happens until it is polled.
pub type ProvisionJob = BoxFuture<'static, Result<ProvisionResult>>;

#[async_trait]
pub trait Instancer: Send + Sync {
    fn state(&self) -> InstancerState;

    fn subscribe(&self) -> Subscription<InstancerState>;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Fill in the guest credentials of `instance` and return the job that
    /// creates its VM. Errors when the instancer cannot produce VMs right now.
    async fn add_instance(
        &self,
        instance: &mut InstanceModel,
        workpool_name: &str,
    ) -> Result<ProvisionJob>;
}

struct BaseInner {
    state: InstancerState,
    subscribers: Subscribers<InstancerState>,
}

/// State and subscriber bookkeeping shared by all instancers.
pub struct InstancerBase {
    name: String,
    inner: Mutex<BaseInner>,
}

impl InstancerBase {
    pub fn new(name: &str, state: InstancerState) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(BaseInner {
                state,
                subscribers: Subscribers::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BaseInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> InstancerState {
        self.lock().state
    }

    pub fn set_state(&self, state: InstancerState) {
        let mut inner = self.lock();
        let old = inner.state;
        if old == state {
            return;
        }
        debug!("Instancer {} changed from {:?} to {:?}", self.name, old, state);
        inner.state = state;
        inner.subscribers.publish(StateChange {
            old,
            new: state,
            sender: self.name.clone(),
        });
    }

    pub fn subscribe(&self) -> Subscription<InstancerState> {
        let mut inner = self.lock();
        let state = inner.state;
        inner.subscribers.subscribe(state, &self.name)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.unsubscribe(id);
    }
}

fn random_suffix() -> u32 {
    rand::random::<u32>() & 0xfffff
}

/// Produces linked clones of a VM image. Available exactly while the image is.
pub struct CloneInstancer {
    base: std::sync::Arc<InstancerBase>,
    image: VmImageHandle,
    services: Services,
    watcher: JoinHandle<()>,
    subscription_id: SubscriptionId,
}

impl CloneInstancer {
    pub async fn start(image: VmImageHandle, services: Services) -> Result<Self> {
        let base = std::sync::Arc::new(InstancerBase::new(
            &format!("clone:{}", image.id()),
            InstancerState::Unavailable,
        ));
        let mut changes = image.subscribe().await?;
        let subscription_id = changes.id();

        let watched = base.clone();
        let watcher = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if change.new.is_failure() {
                    watched.set_state(InstancerState::Failed);
                } else if change.new.is_ready() {
                    watched.set_state(InstancerState::Available);
                }
            }
            debug!("VM image behind {} stopped publishing", watched.name);
        });

        Ok(Self {
            base,
            image,
            services,
            watcher,
            subscription_id,
        })
    }
}

impl Drop for CloneInstancer {
    fn drop(&mut self) {
        self.watcher.abort();
        self.image.unsubscribe(self.subscription_id);
    }
}

#[async_trait]
impl Instancer for CloneInstancer {
    fn state(&self) -> InstancerState {
        self.base.state()
    }

    fn subscribe(&self) -> Subscription<InstancerState> {
        self.base.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.base.unsubscribe(id)
    }

    async fn add_instance(
        &self,
        instance: &mut InstanceModel,
        workpool_name: &str,
    ) -> Result<ProvisionJob> {
        let vm_image = self.image.model().await?;
        if vm_image.state != VmImageState::Available {
            return Err(WorkpoolError::Instancing(format!(
                "VM image {} is not available (state: {})",
                vm_image.name, vm_image.state
            )));
        }

        instance.guest_username = GUEST_USERNAME.to_string();
        instance.guest_password = self.services.guest_password.clone();
        instance.autologon = true;

        let vc_config = self.services.vc.config();
        let request = CloneRequest {
            vm_name: format!("{} Instance {:05x}", workpool_name, random_suffix()),
            vm_location: vc_config.vm_location.clone(),
            vc_config,
            vm_image,
            guest_password: self.services.guest_password.clone(),
        };
        info!("Cloning {} from image {}", request.vm_name, request.vm_image.name);

        let provisioner = self.services.provisioner.clone();
        Ok(async move { provisioner.clone_vm(request).await }.boxed())
    }
}

/// Installs every instance from scratch. Always available.
pub struct InstallInstancer {
    base: InstancerBase,
    pattern: VmPattern,
    services: Services,
}

impl InstallInstancer {
    pub fn new(pattern: VmPattern, services: Services) -> Self {
        Self {
            base: InstancerBase::new("install", InstancerState::Available),
            pattern,
            services,
        }
    }
}

#[async_trait]
impl Instancer for InstallInstancer {
    fn state(&self) -> InstancerState {
        self.base.state()
    }

    fn subscribe(&self) -> Subscription<InstancerState> {
        self.base.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.base.unsubscribe(id)
    }

    async fn add_instance(
        &self,
        instance: &mut InstanceModel,
        workpool_name: &str,
    ) -> Result<ProvisionJob> {
        instance.guest_username = self.pattern.guest_username().to_string();
        instance.guest_password = self.services.guest_password.clone();
        instance.autologon = true;

        let vc_config = self.services.vc.config();
        let request = InstallRequest {
            vm_name: format!("{} Instance {:05x}", workpool_name, random_suffix()),
            vm_pattern: self.pattern.clone(),
            hardware: Default::default(),
            vm_location: vc_config.vm_location.clone(),
            vc_config,
            guest_password: self.services.guest_password.clone(),
        };
        info!("Installing {}", request.vm_name);

        let provisioner = self.services.provisioner.clone();
        let vc = self.services.vc.clone();
        Ok(async move {
            let result = provisioner.install_vm(request).await?;
            let vm = vc.vm(&result.moid).await?;
            vm.create_snapshot(CLEAN_SNAPSHOT, "Freshly installed guest").await?;
            Ok::<_, WorkpoolError>(result)
        }
        .boxed())
    }
}

/// Instancer of custom pools: never creates anything.
pub struct NullInstancer {
    base: InstancerBase,
}

impl NullInstancer {
    pub fn new() -> Self {
        Self {
            base: InstancerBase::new("custom", InstancerState::Available),
        }
    }
}

impl Default for NullInstancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Instancer for NullInstancer {
    fn state(&self) -> InstancerState {
        self.base.state()
    }

    fn subscribe(&self) -> Subscription<InstancerState> {
        self.base.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.base.unsubscribe(id)
    }

    async fn add_instance(
        &self,
        _instance: &mut InstanceModel,
        _workpool_name: &str,
    ) -> Result<ProvisionJob> {
        Err(WorkpoolError::Instancing(
            "Custom workpools do not create instances".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn base_publishes_only_real_changes() {
        let base = InstancerBase::new("test", InstancerState::Unavailable);
        let mut subscription = base.subscribe();
        assert_eq!(
            subscription.recv().await.map(|c| c.new),
            Some(InstancerState::Unavailable)
        );

        base.set_state(InstancerState::Unavailable);
        base.set_state(InstancerState::Available);

        let change = subscription.recv().await.expect("Missing change");
        assert_eq!(change.old, InstancerState::Unavailable);
        assert_eq!(change.new, InstancerState::Available);
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn null_instancer_refuses() {
        let instancer = NullInstancer::new();
        let mut instance = InstanceModel::new("pool");
        let result = instancer.add_instance(&mut instance, "pool").await;
        assert!(matches!(result, Err(WorkpoolError::Instancing(_))));
        assert_eq!(instancer.state(), InstancerState::Available);
    }
}
