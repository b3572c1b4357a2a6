//! A workpool: a bounded set of VM instances leased out one at a time.
//!
//! Every workpool runs as one tokio task that owns its [`WorkpoolModel`] and a
//! FIFO queue of waiters. Requests arrive through a [`WorkpoolHandle`]; backend
//! work (provisioning, destroying, powering off) runs on the dispatcher and
//! comes back as messages.
//!
//! All pool decisions happen in `process()`. It works on a copy of the model,
//! commits that copy in one transaction, and only then performs the side
//! effects it planned (granting leases, starting jobs). If the commit fails,
//! nothing happens and the waiters stay queued.

use crate::backend::{ProvisionResult, Services};
use crate::error::{Result, WorkpoolError};
use crate::events::{StateChange, Subscribers, Subscription, SubscriptionId};
use crate::instancer::{Instancer, InstancerState, ProvisionJob};
use crate::model::{InstanceModel, InstanceState, LeaseModel, WorkpoolModel, WorkpoolState};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Fields an administrator may change on a live pool.
#[derive(Debug, Clone)]
pub struct WorkpoolUpdate {
    pub name: String,
    pub maximum_instances: i32,
}

enum WorkpoolMessage {
    Acquire(oneshot::Sender<Result<LeaseModel>>),
    Release {
        lease_id: String,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Reset(oneshot::Sender<Result<()>>),
    Update(WorkpoolUpdate, oneshot::Sender<Result<()>>),
    Delete(oneshot::Sender<Result<()>>),
    Forget(oneshot::Sender<Result<()>>),
    AddInstance(InstanceModel, oneshot::Sender<Result<InstanceModel>>),
    RemoveInstance(String, oneshot::Sender<Result<()>>),
    Model(oneshot::Sender<WorkpoolModel>),
    Subscribe(oneshot::Sender<Subscription<WorkpoolState>>),
    Unsubscribe(SubscriptionId),
    InstancingComplete {
        instance_id: String,
        result: Result<ProvisionResult>,
    },
    InstanceRemoved {
        instance_id: String,
        result: Result<()>,
    },
    ResetComplete(Result<()>),
}

/// Cheap, cloneable address of a running workpool.
#[derive(Clone)]
pub struct WorkpoolHandle {
    id: String,
    mailbox: mpsc::UnboundedSender<WorkpoolMessage>,
}

impl WorkpoolHandle {
    /// Start the workpool task around `model`, creating instances with `instancer`.
    pub fn spawn(model: WorkpoolModel, instancer: Arc<dyn Instancer>, services: Services) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let id = model.id.clone();
        let span = info_span!("workpool", workpool = %id);

        let actor = WorkpoolActor {
            model,
            instancer,
            services,
            waiters: VecDeque::new(),
            next_waiter: 0,
            subscribers: Subscribers::default(),
            mailbox: mailbox.downgrade(),
            reset_in_flight: false,
        };
        tokio::spawn(actor.run(inbox).instrument(span));

        Self { id, mailbox }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn stopped(&self) -> WorkpoolError {
        WorkpoolError::Stopped(format!("Workpool {}", self.id))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkpoolMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.send(build(tx)).map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Queue for a lease. The request is registered before this returns, so
    /// queue position follows call order; the future resolves once an
    /// instance is granted. Dropping the future gives up the place in line.
    pub fn acquire(&self) -> PendingLease {
        let (tx, rx) = oneshot::channel();
        let sent = self.mailbox.send(WorkpoolMessage::Acquire(tx)).is_ok();
        PendingLease {
            workpool_id: self.id.clone(),
            mailbox: self.mailbox.clone(),
            reply: sent.then_some(rx),
        }
    }

    /// Hand a leased instance back.
    pub async fn release(&self, lease: &LeaseModel) -> Result<()> {
        let lease_id = lease.id.clone();
        self.request(|reply| WorkpoolMessage::Release {
            lease_id,
            reply: Some(reply),
        })
        .await?
    }

    /// Power every instance off and drop all leases. Only valid while available.
    pub async fn reset(&self) -> Result<()> {
        self.request(WorkpoolMessage::Reset).await?
    }

    pub async fn update(&self, update: WorkpoolUpdate) -> Result<()> {
        self.request(|reply| WorkpoolMessage::Update(update, reply)).await?
    }

    /// Destroy all instances, then remove the pool.
    pub async fn delete(&self) -> Result<()> {
        self.request(WorkpoolMessage::Delete).await?
    }

    /// Remove the pool without touching its VMs.
    pub async fn forget(&self) -> Result<()> {
        self.request(WorkpoolMessage::Forget).await?
    }

    /// Register an existing VM as an available instance.
    pub async fn add_instance(&self, instance: InstanceModel) -> Result<InstanceModel> {
        self.request(|reply| WorkpoolMessage::AddInstance(instance, reply))
            .await?
    }

    /// Drop an instance from the pool without touching its VM.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(|reply| WorkpoolMessage::RemoveInstance(instance_id, reply))
            .await?
    }

    /// Point-in-time copy of the pool model.
    pub async fn model(&self) -> Result<WorkpoolModel> {
        self.request(WorkpoolMessage::Model).await
    }

    pub async fn instance(&self, instance_id: &str) -> Result<Option<InstanceModel>> {
        Ok(self.model().await?.instance(instance_id).cloned())
    }

    pub async fn subscribe(&self) -> Result<Subscription<WorkpoolState>> {
        self.request(WorkpoolMessage::Subscribe).await
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.mailbox.send(WorkpoolMessage::Unsubscribe(id));
    }
}

/// A queued [`WorkpoolHandle::acquire`].
///
/// A lease can be granted after the caller stopped polling but before the
/// future is dropped. Dropping it then returns that lease to the pool.
pub struct PendingLease {
    workpool_id: String,
    mailbox: mpsc::UnboundedSender<WorkpoolMessage>,
    reply: Option<oneshot::Receiver<Result<LeaseModel>>>,
}

impl Future for PendingLease {
    type Output = Result<LeaseModel>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let granted = match this.reply.as_mut() {
            Some(reply) => ready!(Pin::new(reply).poll(cx)).ok(),
            None => None,
        };
        this.reply = None;
        Poll::Ready(granted.unwrap_or_else(|| {
            Err(WorkpoolError::Stopped(format!("Workpool {}", this.workpool_id)))
        }))
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        let Some(mut reply) = self.reply.take() else {
            return;
        };
        reply.close();
        if let Ok(Ok(lease)) = reply.try_recv() {
            warn!("Acquire was dropped after lease {} was granted, returning it", lease.id);
            let _ = self.mailbox.send(WorkpoolMessage::Release {
                lease_id: lease.id,
                reply: None,
            });
        }
    }
}

struct Waiter {
    id: u64,
    reply: oneshot::Sender<Result<LeaseModel>>,
}

/// Side effects planned by `process()`, run only after the model is committed.
enum Effect {
    Provision { instance_id: String, job: ProvisionJob },
    Grant { waiter: u64, lease: LeaseModel },
    Destroy(InstanceModel),
    PowerOffAll(Vec<InstanceModel>),
}

struct WorkpoolActor {
    model: WorkpoolModel,
    instancer: Arc<dyn Instancer>,
    services: Services,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    subscribers: Subscribers<WorkpoolState>,
    mailbox: mpsc::WeakUnboundedSender<WorkpoolMessage>,
    reset_in_flight: bool,
}

impl WorkpoolActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<WorkpoolMessage>) {
        let mut instancer_events = self.instancer.subscribe();
        self.recover().await;
        self.process().await;

        while self.model.state != WorkpoolState::Deleted {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                Some(change) = instancer_events.recv() => {
                    self.on_instancer_state(change.new).await;
                }
            }
        }

        self.instancer.unsubscribe(instancer_events.id());
        self.fail_waiters("Workpool has stopped.");
        debug!("Workpool task finished");
    }

    /// Leases do not survive a restart, and operations that were in flight
    /// are marked failed. Failed instances are dropped from the pool.
    async fn recover(&mut self) {
        let mut next = self.model.clone();
        next.leases.clear();
        next.state = next.state.failed_state_or_self();
        for instance in next.instances.iter_mut() {
            instance.state = instance.state.failed_state_or_self();
        }
        next.instances.retain(|i| {
            if i.state.is_failure() {
                warn!("Dropping instance {} left {} by a restart", i.id, i.state);
                false
            } else {
                true
            }
        });

        if next != self.model {
            if let Err(e) = self.commit(next).await {
                error!("Failed to persist recovered workpool: {}", e);
            }
        }
    }

    async fn handle(&mut self, message: WorkpoolMessage) {
        match message {
            WorkpoolMessage::Acquire(reply) => {
                let id = self.next_waiter;
                self.next_waiter += 1;
                debug!("Adding waiter {} ({} already queued)", id, self.waiters.len());
                self.waiters.push_back(Waiter { id, reply });
                self.process().await;
            }
            WorkpoolMessage::Release { lease_id, reply } => {
                let result = self.release(&lease_id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(e) = result {
                    warn!("Failed to return undelivered lease {}: {}", lease_id, e);
                }
                self.process().await;
            }
            WorkpoolMessage::Reset(reply) => {
                let result = self.reset().await;
                self.process().await;
                let _ = reply.send(result);
            }
            WorkpoolMessage::Update(update, reply) => {
                let result = self.update(update).await;
                self.process().await;
                let _ = reply.send(result);
            }
            WorkpoolMessage::Delete(reply) => {
                let result = self.start_deleting(false).await;
                self.process().await;
                let _ = reply.send(result);
            }
            WorkpoolMessage::Forget(reply) => {
                let result = self.start_deleting(true).await;
                self.process().await;
                let _ = reply.send(result);
            }
            WorkpoolMessage::AddInstance(instance, reply) => {
                let result = self.add_instance(instance).await;
                let _ = reply.send(result);
                self.process().await;
            }
            WorkpoolMessage::RemoveInstance(instance_id, reply) => {
                let result = self.remove_instance(&instance_id).await;
                let _ = reply.send(result);
                self.process().await;
            }
            WorkpoolMessage::Model(reply) => {
                let _ = reply.send(self.model.clone());
            }
            WorkpoolMessage::Subscribe(reply) => {
                let subscription = self.subscribers.subscribe(self.model.state, &self.model.id);
                let _ = reply.send(subscription);
            }
            WorkpoolMessage::Unsubscribe(id) => self.subscribers.unsubscribe(id),
            WorkpoolMessage::InstancingComplete { instance_id, result } => {
                self.on_instancing_complete(&instance_id, result).await;
                self.process().await;
            }
            WorkpoolMessage::InstanceRemoved { instance_id, result } => {
                self.on_instance_removed(&instance_id, result).await;
                self.process().await;
            }
            WorkpoolMessage::ResetComplete(result) => {
                self.reset_in_flight = false;
                if self.model.state == WorkpoolState::Resetting {
                    let last_error = match result {
                        Ok(()) => String::new(),
                        Err(e) => format!("Reset did not power off every instance - {}.", e),
                    };
                    if let Err(e) = self.set_state(WorkpoolState::Available, &last_error).await {
                        error!("Failed to finish reset: {}", e);
                    }
                }
                self.process().await;
            }
        }
    }

    async fn release(&mut self, lease_id: &str) -> Result<()> {
        if !self.model.leases.iter().any(|l| l.id == lease_id) {
            return Err(WorkpoolError::LeaseNotPresent(lease_id.to_string()));
        }
        info!("Releasing lease {}", lease_id);
        let mut next = self.model.clone();
        next.leases.retain(|l| l.id != lease_id);
        self.commit(next).await
    }

    async fn reset(&mut self) -> Result<()> {
        if self.model.state != WorkpoolState::Available {
            return Err(WorkpoolError::InvalidState(format!(
                "Cannot reset a workpool in state {}.",
                self.model.state
            )));
        }
        self.reset_in_flight = false;
        self.set_state(WorkpoolState::Resetting, "").await
    }

    async fn update(&mut self, update: WorkpoolUpdate) -> Result<()> {
        if update.maximum_instances < 0 {
            return Err(WorkpoolError::InvalidInput(
                "Workpool size cannot be less than zero.".to_string(),
            ));
        }
        debug!("Updating workpool: {:?}", update);
        let mut next = self.model.clone();
        next.name = update.name;
        next.maximum_instances = update.maximum_instances;
        self.commit(next).await
    }

    async fn start_deleting(&mut self, forget: bool) -> Result<()> {
        if !self.model.state.is_deletable() {
            return Err(WorkpoolError::InvalidState(format!(
                "Cannot delete in the current state: {}.",
                self.model.state
            )));
        }
        let mut next = self.model.clone();
        if forget {
            info!("Forgetting workpool and its {} instances", next.instances.len());
            next.instances.clear();
            next.leases.clear();
        }
        next.state = WorkpoolState::Deleting;
        next.last_error.clear();
        self.commit(next).await
    }

    async fn add_instance(&mut self, mut instance: InstanceModel) -> Result<InstanceModel> {
        if !instance.moid.as_deref().is_some_and(|moid| !moid.is_empty()) {
            return Err(WorkpoolError::InvalidInput(
                "An instance needs the moid of an existing VM.".to_string(),
            ));
        }
        instance.workpool_id = self.model.id.clone();
        instance.state = InstanceState::Available;
        let mut next = self.model.clone();
        next.instances.push(instance.clone());
        self.commit(next).await?;
        info!("Added instance {} ({:?})", instance.id, instance.moid);
        Ok(instance)
    }

    async fn remove_instance(&mut self, instance_id: &str) -> Result<()> {
        let mut next = self.model.clone();
        if next.remove_instance(instance_id).is_none() {
            return Err(WorkpoolError::NotFound(format!("instance {}", instance_id)));
        }
        self.commit(next).await
    }

    async fn on_instancing_complete(&mut self, instance_id: &str, result: Result<ProvisionResult>) {
        let mut next = self.model.clone();
        let Some(instance) = next.instance_mut(instance_id) else {
            warn!("Instancing finished for unknown instance {}", instance_id);
            return;
        };

        match result {
            Ok(provisioned) => {
                info!("Instance {} is ready as {}", instance_id, provisioned.moid);
                instance.moid = Some(provisioned.moid);
                instance.state = InstanceState::Available;
                instance.last_error.clear();
                next.last_error.clear();
            }
            Err(e) => {
                let message = format!("Instancing failed - {}.", e);
                error!("{}", message);
                next.remove_instance(instance_id);
                next.last_error = message;
            }
        }

        if let Err(e) = self.commit(next).await {
            error!("Failed to record instancing result: {}", e);
        }
    }

    async fn on_instance_removed(&mut self, instance_id: &str, result: Result<()>) {
        let mut next = self.model.clone();
        match result {
            Ok(()) => {
                info!("Removing instance model {}", instance_id);
                next.remove_instance(instance_id);
            }
            Err(e) => {
                let message = format!("Failed to delete instance {} - {}.", instance_id, e);
                error!("{}", message);
                if let Some(instance) = next.instance_mut(instance_id) {
                    instance.state = InstanceState::DeleteFailed;
                    instance.last_error = e.to_string();
                }
                if next.state == WorkpoolState::Deleting {
                    next.state = WorkpoolState::DeleteFailed;
                }
                next.last_error = message;
            }
        }

        if let Err(e) = self.commit(next).await {
            error!("Failed to record instance removal: {}", e);
        }
    }

    async fn on_instancer_state(&mut self, state: InstancerState) {
        debug!("Received instancer state {:?}", state);
        if !self.model.state.is_steady() {
            debug!("Ignoring instancer state while {}", self.model.state);
            return;
        }

        let next = match state {
            InstancerState::Available => WorkpoolState::Available,
            InstancerState::Unavailable => WorkpoolState::WaitingForInstancer,
            InstancerState::Failed => WorkpoolState::Unavailable,
        };
        if next != self.model.state {
            let last_error = self.model.last_error.clone();
            if let Err(e) = self.set_state(next, &last_error).await {
                error!("Failed to apply instancer state: {}", e);
            }
        }
        self.process().await;
    }

    async fn set_state(&mut self, state: WorkpoolState, last_error: &str) -> Result<()> {
        let mut next = self.model.clone();
        next.state = state;
        next.last_error = last_error.to_string();
        self.commit(next).await
    }

    /// Persist `next` and make it the live model. A deleted pool is removed
    /// from the database instead.
    async fn commit(&mut self, next: WorkpoolModel) -> Result<()> {
        if next.state == WorkpoolState::Deleted {
            self.services.repository.delete_workpool(&next.id).await?;
        } else {
            self.services.repository.save_workpool(&next).await?;
        }

        let old = self.model.state;
        self.model = next;
        if old != self.model.state {
            info!("Transitioned from state {} to {}", old, self.model.state);
            self.subscribers.publish(StateChange {
                old,
                new: self.model.state,
                sender: self.model.id.clone(),
            });
        }
        Ok(())
    }

    fn fail_waiters(&mut self, message: &str) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter
                .reply
                .send(Err(WorkpoolError::Unavailable(message.to_string())));
        }
    }

    /// Decide what the pool should do next given its state, then commit and act.
    async fn process(&mut self) {
        debug!("Processing workpool");
        self.waiters.retain(|w| !w.reply.is_closed());

        let mut next = self.model.clone();
        let mut effects = Vec::new();
        let mut fail_message = None;

        match next.state {
            WorkpoolState::Available => {
                reclaim_overallocated(&mut next, &mut effects);
                self.satisfy_waiters(&mut next, &mut effects).await;
            }
            WorkpoolState::Deleting => {
                fail_message = Some("Workpool is being deleted.");
                plan_deletion(&mut next, &mut effects);
            }
            WorkpoolState::Resetting => {
                fail_message = Some("Workpool is resetting.");
                next.leases.clear();
                if !self.reset_in_flight {
                    info!("Powering off all instances");
                    let instances = next.instances.iter().filter(|i| i.moid.is_some()).cloned();
                    effects.push(Effect::PowerOffAll(instances.collect()));
                }
            }
            _ => {}
        }

        if next != self.model {
            if let Err(e) = self.commit(next).await {
                error!("Failed to commit workpool changes, nothing was done: {}", e);
                return;
            }
        }

        if let Some(message) = fail_message {
            self.fail_waiters(message);
        }
        self.apply(effects);
    }

    /// Walk the queue front to back. Each waiter gets a free instance, or an
    /// instance already being created, or a newly started one. The walk stops
    /// at the first waiter none of these can serve.
    async fn satisfy_waiters(&self, next: &mut WorkpoolModel, effects: &mut Vec<Effect>) {
        let mut instancing = next
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Instancing)
            .count();

        for waiter in self.waiters.iter().map(|w| w.id) {
            if self.try_existing_instances(waiter, next, effects).await {
                info!("Completed waiter {} with a free lease", waiter);
            } else if instancing > 0 {
                instancing -= 1;
            } else if self.try_new_instance(next, effects).await {
                info!("Started a new instance for waiter {}", waiter);
            } else {
                break;
            }
        }
    }

    async fn try_existing_instances(
        &self,
        waiter: u64,
        next: &mut WorkpoolModel,
        effects: &mut Vec<Effect>,
    ) -> bool {
        loop {
            let Some(instance) = next.free_instances().first().map(|i| (*i).clone()) else {
                return false;
            };

            if self.vm_exists(&instance).await {
                let lease = LeaseModel::new(instance, self.services.vc.config());
                next.leases.push(lease.clone());
                effects.push(Effect::Grant { waiter, lease });
                return true;
            }

            debug!("VM {:?} not found, cleaning it up", instance.moid);
            mark_deleting(next, &instance.id, effects);
        }
    }

    /// Whether the instance's VM is still there. Backend errors count as
    /// present so an unreachable backend never causes instances to be destroyed.
    async fn vm_exists(&self, instance: &InstanceModel) -> bool {
        let Some(moid) = instance.moid.as_deref() else {
            return false;
        };
        let exists = match self.services.vc.vm(moid).await {
            Ok(vm) => vm.exists().await,
            Err(e) => Err(e),
        };
        exists.unwrap_or_else(|e| {
            warn!("Could not check VM {}: {}", moid, e);
            true
        })
    }

    async fn try_new_instance(&self, next: &mut WorkpoolModel, effects: &mut Vec<Effect>) -> bool {
        if !next.is_growable() {
            return false;
        }
        if next.instances.len() >= next.capacity() {
            info!("Workpool is already at maximum capacity");
            return false;
        }

        let mut instance = InstanceModel::new(&next.id);
        match self.instancer.add_instance(&mut instance, &next.name).await {
            Ok(job) => {
                instance.state = InstanceState::Instancing;
                effects.push(Effect::Provision {
                    instance_id: instance.id.clone(),
                    job,
                });
                next.instances.push(instance);
                true
            }
            Err(e) => {
                let message = format!("Instancing failed - {}.", e);
                warn!("{}", message);
                next.last_error = message;
                false
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Provision { instance_id, job } => {
                    let mailbox = self.mailbox.clone();
                    self.services.dispatcher.spawn(async move {
                        let result = job.await;
                        notify(&mailbox, WorkpoolMessage::InstancingComplete { instance_id, result });
                    });
                }
                Effect::Grant { waiter, lease } => self.grant(waiter, lease),
                Effect::Destroy(instance) => self.destroy(instance),
                Effect::PowerOffAll(instances) => {
                    self.reset_in_flight = true;
                    self.power_off_all(instances);
                }
            }
        }
    }

    fn grant(&mut self, waiter: u64, lease: LeaseModel) {
        let delivered = match self.waiters.iter().position(|w| w.id == waiter) {
            Some(position) => self
                .waiters
                .remove(position)
                .is_some_and(|w| w.reply.send(Ok(lease.clone())).is_ok()),
            None => false,
        };

        if !delivered {
            warn!("Waiter {} went away, returning lease {}", waiter, lease.id);
            notify(
                &self.mailbox,
                WorkpoolMessage::Release {
                    lease_id: lease.id,
                    reply: None,
                },
            );
        }
    }

    fn destroy(&self, instance: InstanceModel) {
        info!("Deleting instance {} ({:?})", instance.id, instance.moid);
        let vc = self.services.vc.clone();
        let mailbox = self.mailbox.clone();
        self.services.dispatcher.spawn(async move {
            let result = match instance.moid.as_deref() {
                Some(moid) => async {
                    let vm = vc.vm(moid).await?;
                    if vm.exists().await? {
                        vm.power_off().await?;
                        vm.destroy().await?;
                    }
                    Ok::<(), WorkpoolError>(())
                }
                .await,
                None => Ok(()),
            };
            notify(
                &mailbox,
                WorkpoolMessage::InstanceRemoved {
                    instance_id: instance.id,
                    result,
                },
            );
        });
    }

    fn power_off_all(&self, instances: Vec<InstanceModel>) {
        let vc = self.services.vc.clone();
        let mailbox = self.mailbox.clone();
        self.services.dispatcher.spawn(async move {
            let mut first_error = None;
            for instance in instances {
                let Some(moid) = instance.moid.as_deref() else {
                    continue;
                };
                info!("Powering off instance ({}, {})", instance.id, moid);
                let result = match vc.vm(moid).await {
                    Ok(vm) => vm.power_off().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Failed to power off {}: {}", moid, e);
                    first_error.get_or_insert(e);
                }
            }
            let result = first_error.map_or(Ok(()), Err);
            notify(&mailbox, WorkpoolMessage::ResetComplete(result));
        });
    }
}

/// Destroy free instances beyond the pool's maximum. Custom pools keep theirs.
fn reclaim_overallocated(next: &mut WorkpoolModel, effects: &mut Vec<Effect>) {
    if !next.is_growable() {
        return;
    }

    let free: Vec<String> = next.free_instances().iter().map(|i| i.id.clone()).collect();
    let surplus = free.len().saturating_sub(next.capacity());
    if surplus > 0 {
        debug!("{} instances are overallocated", surplus);
    }
    for id in free.iter().take(surplus) {
        mark_deleting(next, id, effects);
    }
}

/// Tear down every instance that is not already busy; an empty pool is done.
fn plan_deletion(next: &mut WorkpoolModel, effects: &mut Vec<Effect>) {
    if next.instances.is_empty() {
        debug!("No instances left, deleting workpool");
        next.state = WorkpoolState::Deleted;
        return;
    }

    if !next.leases.is_empty() {
        debug!("Clearing {} leases", next.leases.len());
        next.leases.clear();
    }

    let doomed: Vec<String> = next
        .instances
        .iter()
        .filter(|i| {
            matches!(
                i.state,
                InstanceState::Created
                    | InstanceState::Available
                    | InstanceState::InstancingFailed
                    | InstanceState::DeleteFailed
            )
        })
        .map(|i| i.id.clone())
        .collect();
    for id in doomed {
        mark_deleting(next, &id, effects);
    }
}

fn mark_deleting(next: &mut WorkpoolModel, instance_id: &str, effects: &mut Vec<Effect>) {
    if let Some(instance) = next.instance_mut(instance_id) {
        instance.state = InstanceState::Deleting;
        effects.push(Effect::Destroy(instance.clone()));
    }
}

fn notify(mailbox: &mpsc::WeakUnboundedSender<WorkpoolMessage>, message: WorkpoolMessage) {
    match mailbox.upgrade() {
        Some(mailbox) => {
            let _ = mailbox.send(message);
        }
        None => debug!("Workpool stopped before its operation finished"),
    }
}
