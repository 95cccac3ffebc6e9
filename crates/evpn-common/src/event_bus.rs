//! Publish/subscribe registry with per-subscriber bounded channels.
//!
//! Subscribers register once with a name, a priority (lower = earlier) and
//! the event types they care about. Each subscriber gets its own bounded
//! channel; how a full channel is handled is chosen per subscriber through
//! [`DeliveryPolicy`].
//!
//! The same bus type carries desired-state notifications (event type =
//! resource kind) and netlink snapshot notifications (event type =
//! `route_added`, `fdb_entry_deleted`, ...).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default depth of a subscriber channel.
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Errors from the event bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("subscriber {0} is already registered")]
    DuplicateSubscriber(String),

    #[error("subscriber {0} is not registered")]
    UnknownSubscriber(String),

    #[error("channel of subscriber {0} is closed")]
    Closed(String),

    #[error("queue of subscriber {0} is full, event dropped")]
    QueueFull(String),
}

/// What to do when a subscriber's channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Wait for free capacity. A stalled subscriber stalls the publisher.
    #[default]
    Backpressure,
    /// Never wait; the event is dropped and a warning is logged.
    DropNewest,
}

/// Registration parameters of a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub name: String,
    /// Lower values are notified first.
    pub priority: i32,
    /// Event types the subscriber is interested in.
    pub events: Vec<String>,
    pub queue_depth: usize,
    pub policy: DeliveryPolicy,
}

impl SubscriberConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            events: Vec::new(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn wants(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

/// Public view of a registered subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub name: String,
    pub priority: i32,
}

struct Subscriber<E> {
    config: SubscriberConfig,
    tx: mpsc::Sender<E>,
}

impl<E> Subscriber<E> {
    fn info(&self) -> SubscriberInfo {
        SubscriberInfo {
            name: self.config.name.clone(),
            priority: self.config.priority,
        }
    }

    async fn deliver(&self, event: E) -> Result<(), EventBusError> {
        let name = &self.config.name;
        match self.config.policy {
            DeliveryPolicy::Backpressure => self
                .tx
                .send(event)
                .await
                .map_err(|_| EventBusError::Closed(name.clone())),
            DeliveryPolicy::DropNewest => self.tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EventBusError::QueueFull(name.clone()),
                mpsc::error::TrySendError::Closed(_) => EventBusError::Closed(name.clone()),
            }),
        }
    }
}

/// Priority-ordered publish/subscribe registry.
pub struct EventBus<E> {
    /// Kept sorted by priority; equal priorities keep registration order.
    subscribers: RwLock<Vec<Arc<Subscriber<E>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns the receiving end of its channel.
    pub fn subscribe(&self, config: SubscriberConfig) -> Result<mpsc::Receiver<E>, EventBusError> {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|s| s.config.name == config.name) {
            return Err(EventBusError::DuplicateSubscriber(config.name));
        }

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let position = subscribers.partition_point(|s| s.config.priority <= config.priority);
        debug!(
            subscriber = %config.name,
            priority = config.priority,
            events = ?config.events,
            "Subscriber registered"
        );
        subscribers.insert(position, Arc::new(Subscriber { config, tx }));
        Ok(rx)
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.config.name != name);
        before != subscribers.len()
    }

    /// Subscribers interested in `event_type`, in notification order.
    pub fn subscribers(&self, event_type: &str) -> Vec<SubscriberInfo> {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.config.wants(event_type))
            .map(|s| s.info())
            .collect()
    }

    /// Event types a subscriber registered for, or `None` if unknown.
    pub fn event_types_for(&self, name: &str) -> Option<Vec<String>> {
        self.subscribers
            .read()
            .iter()
            .find(|s| s.config.name == name)
            .map(|s| s.config.events.clone())
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.subscribers.read().iter().any(|s| s.config.name == name)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Delivers `event` to every subscriber of `event_type` in priority
    /// order and returns how many subscribers accepted it.
    ///
    /// Delivery failures (closed channel, full queue under
    /// [`DeliveryPolicy::DropNewest`]) are logged and do not stop delivery
    /// to the remaining subscribers.
    pub async fn publish(&self, event_type: &str, event: E) -> usize {
        let targets: Vec<Arc<Subscriber<E>>> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.config.wants(event_type))
            .cloned()
            .collect();

        let mut delivered = 0;
        for subscriber in targets {
            match subscriber.deliver(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(event_type = %event_type, error = %e, "Event not delivered"),
            }
        }
        delivered
    }

    /// Delivers `event` to one named subscriber.
    pub async fn publish_to(&self, name: &str, event: E) -> Result<(), EventBusError> {
        let target = self
            .subscribers
            .read()
            .iter()
            .find(|s| s.config.name == name)
            .cloned()
            .ok_or_else(|| EventBusError::UnknownSubscriber(name.to_string()))?;
        target.deliver(event).await
    }
}
