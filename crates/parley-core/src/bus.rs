//! In-process event bus.
//!
//! Subscribers register on a topic with a [`Filter`]. Publishing evaluates
//! each subscriber's filter and hands the event to its bounded queue without
//! waiting. A subscriber whose queue is full is dropped from the bus; its
//! stream yields what was already queued and then ends with
//! [`SubscriptionError::Overflow`]. Nobody else is affected.

use crate::event::{Event, Filter};
use dashmap::DashMap;
use futures_util::Stream;
use parley_protocol::Topic;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Default per-subscriber queue capacity.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Identifier of one registration on the bus.
pub type SubscriptionId = u64;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Undelivered events a subscriber may accumulate before it is dropped.
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Why a subscription stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscription or its connection was released.
    Cancelled,
    /// The subscriber fell too far behind.
    Overflow,
    /// The bus was shut down.
    Shutdown,
}

/// Errors surfaced to a subscriber through its stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscriber queue overflowed after {capacity} undelivered events")]
    Overflow { capacity: usize },
}

struct Subscriber {
    connection_id: Option<String>,
    filter: Filter,
    sender: mpsc::Sender<Arc<Event>>,
    reason: Arc<OnceLock<CloseReason>>,
}

impl Subscriber {
    /// Record the reason; dropping `self` then closes the queue.
    fn close(self, reason: CloseReason) {
        let _ = self.reason.set(reason);
    }
}

struct Inner {
    topics: HashMap<Topic, DashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: BusConfig,
}

impl Inner {
    fn remove(&self, topic: Topic, id: SubscriptionId, reason: CloseReason) -> bool {
        match self.topics.get(&topic).and_then(|subs| subs.remove(&id)) {
            Some((_, subscriber)) => {
                subscriber.close(reason);
                debug!(topic = %topic, subscription = id, ?reason, "Subscriber removed");
                true
            }
            None => false,
        }
    }
}

/// Handle to the event bus. Cloning is cheap and every clone refers to the
/// same set of subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a new bus with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a new bus with custom configuration.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        info!("Creating event bus with config: {:?}", config);
        Self {
            inner: Arc::new(Inner {
                topics: Topic::ALL.iter().map(|t| (*t, DashMap::new())).collect(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register a subscriber not tied to any connection.
    #[must_use]
    pub fn subscribe(&self, topic: Topic, filter: Filter) -> Subscription {
        self.register(None, topic, filter)
    }

    /// Register a subscriber owned by `connection_id`, so it can be released
    /// together with the rest of that connection's subscriptions.
    #[must_use]
    pub fn subscribe_for(&self, connection_id: &str, topic: Topic, filter: Filter) -> Subscription {
        self.register(Some(connection_id.to_string()), topic, filter)
    }

    fn register(&self, connection_id: Option<String>, topic: Topic, filter: Filter) -> Subscription {
        let capacity = self.inner.config.subscriber_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let reason = Arc::new(OnceLock::new());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if self.inner.closed.load(Ordering::Acquire) {
            let _ = reason.set(CloseReason::Shutdown);
        } else if let Some(subscribers) = self.inner.topics.get(&topic) {
            debug!(
                topic = %topic,
                subscription = id,
                connection = connection_id.as_deref().unwrap_or("-"),
                ?filter,
                "Subscribed"
            );
            subscribers.insert(
                id,
                Subscriber {
                    connection_id,
                    filter,
                    sender,
                    reason: Arc::clone(&reason),
                },
            );

            // `close` may have swept this topic between the check and the insert.
            if self.inner.closed.load(Ordering::Acquire) {
                self.inner.remove(topic, id, CloseReason::Shutdown);
            }
        }

        Subscription {
            id,
            topic,
            receiver,
            reason,
            capacity,
            overflow_reported: false,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish an event to every accepting subscriber of its topic.
    ///
    /// Never waits on a subscriber. Returns the number of subscribers the
    /// event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        let Some(subscribers) = self.inner.topics.get(&topic) else {
            return 0;
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        let mut gone = Vec::new();

        for entry in subscribers.iter() {
            if !entry.filter.accepts(&event) {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => overflowed.push(*entry.key()),
                Err(TrySendError::Closed(_)) => gone.push(*entry.key()),
            }
        }

        for id in overflowed {
            warn!(
                topic = %topic,
                subscription = id,
                capacity = self.inner.config.subscriber_capacity,
                "Subscriber overflowed, dropping"
            );
            self.inner.remove(topic, id, CloseReason::Overflow);
        }
        for id in gone {
            self.inner.remove(topic, id, CloseReason::Cancelled);
        }

        trace!(
            topic = %topic,
            conversation = %event.conversation_id(),
            recipients = delivered,
            "Published event"
        );
        delivered
    }

    /// Remove one subscription. Returns `true` if it was registered.
    pub fn unsubscribe(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.inner.remove(topic, id, CloseReason::Cancelled)
    }

    /// Remove every subscription owned by `connection_id`.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe_connection(&self, connection_id: &str) -> usize {
        let mut removed = 0;
        for subscribers in self.inner.topics.values() {
            subscribers.retain(|_, subscriber| {
                if subscriber.connection_id.as_deref() == Some(connection_id) {
                    let _ = subscriber.reason.set(CloseReason::Cancelled);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }

        debug!(connection = %connection_id, removed, "Unsubscribed connection");
        removed
    }

    /// End every stream and refuse further registrations.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for subscribers in self.inner.topics.values() {
            subscribers.retain(|_, subscriber| {
                let _ = subscriber.reason.set(CloseReason::Shutdown);
                false
            });
        }
        info!("Event bus closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner.topics.get(&topic).map_or(0, DashMap::len)
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let per_topic: HashMap<Topic, usize> = self
            .inner
            .topics
            .iter()
            .map(|(topic, subs)| (*topic, subs.len()))
            .collect();
        BusStats {
            total_subscribers: per_topic.values().sum(),
            per_topic,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus statistics.
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Live subscribers across all topics.
    pub total_subscribers: usize,
    /// Live subscribers per topic.
    pub per_topic: HashMap<Topic, usize>,
}

/// The receiving half of a registration.
///
/// A lazy, unbounded, non-restartable stream of accepted events. Dropping it
/// releases the registration.
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    receiver: mpsc::Receiver<Arc<Event>>,
    reason: Arc<OnceLock<CloseReason>>,
    capacity: usize,
    overflow_reported: bool,
    bus: Weak<Inner>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Why the subscription was closed, if it has been.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Result<Arc<Event>, SubscriptionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                if this.close_reason() == Some(CloseReason::Overflow) && !this.overflow_reported {
                    this.overflow_reported = true;
                    Poll::Ready(Some(Err(SubscriptionError::Overflow {
                        capacity: this.capacity,
                    })))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.topic, self.id, CloseReason::Cancelled);
        }
    }
}
