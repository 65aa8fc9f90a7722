//! Per-execution publish/subscribe channels.
//!
//! Fan-out is synchronous and at-most-once: a subscriber that fails to take an
//! event is logged and skipped. Nothing is buffered, so a late subscriber
//! never sees earlier events.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

use crate::event::{ChannelEvent, ExecutionId};

/// Failure to hand an event to one subscriber.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Receiver closed")]
    Closed,
    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&ChannelEvent) -> Result<(), DeliveryError> + Send + Sync>;

/// Publish/subscribe stream for one execution.
pub struct EventChannel {
    execution_id: ExecutionId,
    subscribers: RwLock<BTreeMap<u64, Handler>>,
    next_id: AtomicU64,
    // Serializes fan-out so every subscriber sees publish order.
    publish_lock: Mutex<()>,
}

impl EventChannel {
    fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            publish_lock: Mutex::new(()),
        }
    }

    /// Execution this channel belongs to.
    #[must_use]
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Register a handler. Events published from now on reach it until the
    /// returned [`Subscription`] is released or dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        tracing::trace!(execution_id = %self.execution_id, subscriber = id, "subscribed");

        Subscription {
            channel: Arc::downgrade(self),
            id,
            execution_id: self.execution_id.clone(),
        }
    }

    /// Deliver an event to every current subscriber, in subscription order.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: &ChannelEvent) -> usize {
        let _order = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let handlers: Vec<(u64, Handler)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            // A handler earlier in this round may have released this one.
            if !self.is_subscribed(id) {
                continue;
            }
            match handler(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        subscriber = id,
                        "Skipping subscriber: {e}"
                    );
                }
            }
        }
        delivered
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_subscribed(&self, id: u64) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn remove(&self, id: u64) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            tracing::trace!(execution_id = %self.execution_id, subscriber = id, "unsubscribed");
        }
    }
}

/// Handle to one registered subscriber. Dropping it unsubscribes.
pub struct Subscription {
    channel: Weak<EventChannel>,
    id: u64,
    execution_id: ExecutionId,
}

impl Subscription {
    /// Execution the subscription listens to.
    #[must_use]
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Stop receiving events.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("execution_id", &self.execution_id)
            .field("id", &self.id)
            .finish()
    }
}

/// Lazily populated set of channels keyed by execution id.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ExecutionId, Arc<EventChannel>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel for an execution, creating it on first use.
    pub fn channel(&self, execution_id: &ExecutionId) -> Arc<EventChannel> {
        if let Some(channel) = self.get(execution_id) {
            return channel;
        }
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            channels
                .entry(execution_id.clone())
                .or_insert_with(|| Arc::new(EventChannel::new(execution_id.clone()))),
        )
    }

    /// Get an existing channel without creating one.
    #[must_use]
    pub fn get(&self, execution_id: &ExecutionId) -> Option<Arc<EventChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    /// Publish onto an execution's channel.
    pub fn publish(&self, execution_id: &ExecutionId, event: impl Into<ChannelEvent>) -> usize {
        self.channel(execution_id).publish(&event.into())
    }

    /// Drop a channel nobody subscribes to and no producer holds.
    ///
    /// Returns true if the channel was removed.
    pub fn release(&self, execution_id: &ExecutionId) -> bool {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let idle = channels
            .get(execution_id)
            .is_some_and(|c| Arc::strong_count(c) == 1 && c.subscriber_count() == 0);
        if idle {
            channels.remove(execution_id);
            tracing::debug!(%execution_id, "Released idle channel");
        }
        idle
    }

    /// Release every idle channel. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = channels.len();
        channels.retain(|_, c| Arc::strong_count(c) > 1 || c.subscriber_count() > 0);
        before - channels.len()
    }

    /// Number of live channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no channel exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
