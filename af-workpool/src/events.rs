//! State-change notifications between actors.
//!
//! A subscriber gets the publisher's current state as its first event, so it
//! never has to race a separate read against the first change.

use std::fmt::Debug;
use tokio::sync::mpsc;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange<S> {
    pub old: S,
    pub new: S,
    /// Id of the publishing actor.
    pub sender: String,
}

/// Receiving end of a subscription. Yields `None` once the publisher stops.
#[derive(Debug)]
pub struct Subscription<S> {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<StateChange<S>>,
}

impl<S> Subscription<S> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StateChange<S>> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<StateChange<S>> {
        self.events.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct Subscribers<S> {
    next_id: SubscriptionId,
    senders: Vec<(SubscriptionId, mpsc::UnboundedSender<StateChange<S>>)>,
}

impl<S> Default for Subscribers<S> {
    fn default() -> Self {
        Self {
            next_id: 1,
            senders: Vec::new(),
        }
    }
}

impl<S: Copy + Debug> Subscribers<S> {
    pub fn subscribe(&mut self, current: S, sender: &str) -> Subscription<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;

        let _ = tx.send(StateChange {
            old: current,
            new: current,
            sender: sender.to_string(),
        });
        self.senders.push((id, tx));

        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.senders.retain(|(sid, _)| *sid != id);
    }

    /// Deliver `change` to every live subscriber, forgetting the ones that went away.
    pub fn publish(&mut self, change: StateChange<S>) {
        self.senders
            .retain(|(_, tx)| tx.send(change.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
