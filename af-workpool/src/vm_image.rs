//! Lifecycle of a VM image: import or install a VM, give it a cloning
//! snapshot, and later delete or forget it.
//!
//! Each image is a single tokio task that owns its model. The rest of the
//! system talks to it through a [`VmImageHandle`]; long backend calls run on
//! the [`Dispatcher`](crate::dispatch::Dispatcher) and report back as messages,
//! so the task never blocks on the backend while holding its state.

use crate::backend::{InstallRequest, ProvisionResult, Services};
use crate::error::{Result, WorkpoolError};
use crate::events::{StateChange, Subscribers, Subscription, SubscriptionId};
use crate::model::{VmImageModel, VmImageState, CLONING_SNAPSHOT};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

enum ImageMessage {
    Model(oneshot::Sender<VmImageModel>),
    Subscribe(oneshot::Sender<Subscription<VmImageState>>),
    Unsubscribe(SubscriptionId),
    Delete(oneshot::Sender<Result<()>>),
    Forget(oneshot::Sender<Result<()>>),
    InstallFinished(Result<ProvisionResult>),
    SnapshotFinished(Result<()>),
    BackingVmDeleted(Result<()>),
}

/// Cheap, cloneable address of a running VM image.
#[derive(Clone)]
pub struct VmImageHandle {
    id: String,
    mailbox: mpsc::UnboundedSender<ImageMessage>,
}

impl VmImageHandle {
    /// Start the image task. Interrupted operations from a previous run are
    /// turned into their failure states first.
    pub fn spawn(model: VmImageModel, services: Services) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let id = model.id.clone();
        let span = info_span!("vm_image", vm_image = %id);

        let actor = VmImageActor {
            model,
            services,
            subscribers: Subscribers::default(),
            mailbox: mailbox.downgrade(),
            stopped: false,
        };
        tokio::spawn(actor.run(inbox).instrument(span));

        Self { id, mailbox }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ImageMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(build(tx))
            .map_err(|_| WorkpoolError::Stopped(format!("VM image {}", self.id)))?;
        rx.await
            .map_err(|_| WorkpoolError::Stopped(format!("VM image {}", self.id)))
    }

    /// Point-in-time copy of the image model.
    pub async fn model(&self) -> Result<VmImageModel> {
        self.request(ImageMessage::Model).await
    }

    pub async fn subscribe(&self) -> Result<Subscription<VmImageState>> {
        self.request(ImageMessage::Subscribe).await
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.mailbox.send(ImageMessage::Unsubscribe(id));
    }

    /// Delete the image and its backing VM.
    pub async fn delete(&self) -> Result<()> {
        self.request(ImageMessage::Delete).await?
    }

    /// Drop the image without touching its VM.
    pub async fn forget(&self) -> Result<()> {
        self.request(ImageMessage::Forget).await?
    }
}

struct VmImageActor {
    model: VmImageModel,
    services: Services,
    subscribers: Subscribers<VmImageState>,
    mailbox: mpsc::WeakUnboundedSender<ImageMessage>,
    stopped: bool,
}

impl VmImageActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ImageMessage>) {
        let recovered = self.model.state.failed_state_or_self();
        if recovered != self.model.state {
            warn!(
                "Image was interrupted while {}, marking it {}",
                self.model.state, recovered
            );
            self.set_state(recovered, "Interrupted by a service restart.").await;
        }
        self.process().await;

        while !self.stopped {
            let Some(message) = inbox.recv().await else {
                break;
            };
            self.handle(message).await;
        }
        debug!("Image task finished");
    }

    async fn handle(&mut self, message: ImageMessage) {
        match message {
            ImageMessage::Model(reply) => {
                let _ = reply.send(self.model.clone());
            }
            ImageMessage::Subscribe(reply) => {
                let subscription = self.subscribers.subscribe(self.model.state, &self.model.id);
                let _ = reply.send(subscription);
            }
            ImageMessage::Unsubscribe(id) => self.subscribers.unsubscribe(id),
            ImageMessage::Delete(reply) => {
                debug!("Backing VM is being deleted");
                let result = self.try_set_deleting(VmImageState::DeleteRequested).await;
                if result.is_ok() {
                    self.process().await;
                }
                let _ = reply.send(result);
            }
            ImageMessage::Forget(reply) => {
                let result = self.try_set_deleting(VmImageState::Deleted).await;
                if result.is_ok() {
                    self.process().await;
                }
                let _ = reply.send(result);
            }
            ImageMessage::InstallFinished(result) => {
                match result {
                    Ok(provisioned) => {
                        info!("Installation was successful");
                        self.model.moid = Some(provisioned.moid);
                        self.set_state(VmImageState::InstallFinished, "").await;
                    }
                    Err(e) => {
                        let message = format!("Installation was unsuccessful - {}.", e);
                        error!("{}", message);
                        self.set_state(VmImageState::InstallFailed, &message).await;
                    }
                }
                self.process().await;
            }
            ImageMessage::SnapshotFinished(result) => {
                match result {
                    Ok(()) => {
                        info!("Base cloning snapshot is in place");
                        self.set_state(VmImageState::Snapshotted, "").await;
                    }
                    Err(e) => {
                        error!("Failed to create base cloning snapshot: {}", e);
                        self.set_state(VmImageState::SnapshotFailed, &e.to_string()).await;
                    }
                }
                self.process().await;
            }
            ImageMessage::BackingVmDeleted(result) => {
                match result {
                    Ok(()) => self.set_state(VmImageState::Deleted, "").await,
                    Err(e) => {
                        error!("Failed to delete backing VM: {}", e);
                        self.set_state(VmImageState::DeleteFailed, &e.to_string()).await;
                    }
                }
                self.process().await;
            }
        }
    }

    async fn try_set_deleting(&mut self, state: VmImageState) -> Result<()> {
        if !self.model.state.is_deletable() {
            return Err(WorkpoolError::InvalidState(format!(
                "Cannot delete in the current state: {}.",
                self.model.state
            )));
        }
        self.set_state(state, "").await;
        Ok(())
    }

    /// Persist and publish a state change. A failed write is logged and the
    /// in-memory state still advances; the next write carries it.
    async fn set_state(&mut self, state: VmImageState, last_error: &str) {
        let old = self.model.state;
        self.model.state = state;
        self.model.last_error = last_error.to_string();

        if let Err(e) = self.services.repository.save_vm_image(&self.model).await {
            error!("Failed to persist image state {}: {}", state, e);
        }

        info!("Transitioned from state {} to {}", old, state);
        self.subscribers.publish(StateChange {
            old,
            new: state,
            sender: self.model.id.clone(),
        });
    }

    /// Look at the current state and start whatever work it calls for.
    async fn process(&mut self) {
        debug!("Processing image");

        if self.model.state == VmImageState::Created {
            let next = if self.model.has_vm() {
                VmImageState::WaitingImport
            } else {
                VmImageState::WaitingInstall
            };
            self.set_state(next, "").await;
        }

        match self.model.state {
            VmImageState::WaitingImport | VmImageState::InstallFinished => {
                self.set_state(VmImageState::CreatingBaseSnapshot, "").await;
                self.create_base_snapshot().await;
            }
            VmImageState::WaitingInstall => {
                self.set_state(VmImageState::Installing, "").await;
                self.install().await;
            }
            VmImageState::Snapshotted => {
                self.set_state(VmImageState::Available, "").await;
            }
            VmImageState::DeleteRequested => {
                self.set_state(VmImageState::Deleting, "").await;
                self.delete_backing_vm();
            }
            VmImageState::Deleted => self.remove().await,
            _ => {}
        }
    }

    async fn create_base_snapshot(&mut self) {
        let moid = self.model.moid.clone().unwrap_or_default();
        let exists = match self.services.vc.vm(&moid).await {
            Ok(vm) => vm.exists().await.map(|exists| exists.then_some(vm)),
            Err(e) => Err(e),
        };

        let vm = match exists {
            Ok(Some(vm)) => vm,
            Ok(None) => {
                error!("The VM with moid {} was not found", moid);
                self.set_state(VmImageState::VmDoesNotExist, "").await;
                return;
            }
            Err(e) => {
                error!("Could not look up VM {}: {}", moid, e);
                self.set_state(VmImageState::VmDoesNotExist, &e.to_string()).await;
                return;
            }
        };

        let mailbox = self.mailbox.clone();
        self.services.dispatcher.spawn(async move {
            let result = async {
                if vm.find_snapshot(CLONING_SNAPSHOT).await?.is_some() {
                    info!("Cloning snapshot is already present");
                } else {
                    info!("Cloning snapshot does not exist, creating it");
                    vm.create_snapshot(
                        CLONING_SNAPSHOT,
                        "Base snapshot used to create additional clones.",
                    )
                    .await?;
                }
                Ok::<(), WorkpoolError>(())
            }
            .await;
            notify(&mailbox, ImageMessage::SnapshotFinished(result));
        });
    }

    async fn install(&mut self) {
        info!("Requesting an installation");
        let Some(pattern) = self.model.vm_pattern.clone() else {
            self.set_state(
                VmImageState::InstallFailed,
                "Installation was unsuccessful - the image has no VM pattern.",
            )
            .await;
            return;
        };

        let vc_config = self.services.vc.config();
        let request = InstallRequest {
            vm_name: self.model.name.clone(),
            vm_pattern: pattern,
            hardware: Default::default(),
            vm_location: vc_config.vm_location.clone(),
            vc_config,
            guest_password: self.services.guest_password.clone(),
        };

        let provisioner = self.services.provisioner.clone();
        let mailbox = self.mailbox.clone();
        self.services.dispatcher.spawn(async move {
            let result = provisioner.install_vm(request).await;
            notify(&mailbox, ImageMessage::InstallFinished(result));
        });
    }

    fn delete_backing_vm(&self) {
        let moid = self.model.moid.clone();
        let vc = self.services.vc.clone();
        let mailbox = self.mailbox.clone();
        self.services.dispatcher.spawn(async move {
            let result = match moid {
                Some(moid) => async {
                    let vm = vc.vm(&moid).await?;
                    vm.power_off().await?;
                    vm.destroy().await
                }
                .await,
                None => Ok(()),
            };
            notify(&mailbox, ImageMessage::BackingVmDeleted(result));
        });
    }

    async fn remove(&mut self) {
        info!("Deleting image instance");
        if let Err(e) = self.services.repository.delete_vm_image(&self.model.id).await {
            error!("Failed to delete image record: {}", e);
        }
        self.stopped = true;
    }
}

fn notify(mailbox: &mpsc::WeakUnboundedSender<ImageMessage>, message: ImageMessage) {
    match mailbox.upgrade() {
        Some(mailbox) => {
            let _ = mailbox.send(message);
        }
        None => debug!("Image stopped before its operation finished"),
    }
}
