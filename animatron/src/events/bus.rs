//! Event Bus - topic-addressed pub/sub router for the assistant
//!
//! Handlers subscribe to a topic and are invoked in subscription order for every
//! publish on that topic. Delivery on one topic is serialized by a per-topic async
//! lock, so a slow handler only holds up its own topic. Every published event is
//! appended to the [`ReplayBuffer`] and broadcast to live observers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::replay::{DEFAULT_REPLAY_CAPACITY, ReplayBuffer, ReplayGap};
use super::types::{Event, Payload, Topic, topics};

/// Default capacity of the live observer channel (events)
pub const DEFAULT_OBSERVER_CAPACITY: usize = 1024;

/// Source recorded for events published without an explicit source
pub const CORE_SOURCE: &str = "core";

const BUS_SOURCE: &str = "event_bus";

/// A subscriber invoked for each event published on its topic
///
/// Returning an error (or panicking) is a handler fault: it is logged and
/// reported on the `handler_fault` topic, and delivery continues.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> eyre::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> eyre::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

struct HandlerFault {
    subscription: SubscriptionId,
    error: String,
}

/// Sequence counter and ring log, always mutated together
struct ReplayState {
    last_sequence: u64,
    buffer: ReplayBuffer,
}

/// Snapshot plus a live receiver that continues exactly where the snapshot ends
pub struct Attachment {
    /// Buffered events, oldest first
    pub backlog: Vec<Event>,
    /// Events published after the backlog was taken
    pub live: broadcast::Receiver<Event>,
    /// Highest sequence id the observer has now seen (or its original cursor)
    pub cursor: u64,
}

/// Counters describing bus activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub handler_faults: u64,
    pub observers: usize,
    pub subscriptions: usize,
    pub retained: usize,
    pub replay_capacity: usize,
}

/// Central event bus for the assistant
pub struct EventBus {
    subscriptions: RwLock<HashMap<Topic, Vec<Subscription>>>,
    topic_locks: Mutex<HashMap<Topic, Arc<tokio::sync::Mutex<()>>>>,
    replay: Mutex<ReplayState>,
    observers: broadcast::Sender<Event>,
    next_subscription: AtomicU64,
    handler_faults: AtomicU64,
}

impl EventBus {
    /// Create a bus retaining `replay_capacity` events for replay
    pub fn new(replay_capacity: usize, observer_capacity: usize) -> Self {
        debug!(replay_capacity, observer_capacity, "EventBus::new: creating event bus");
        let (observers, _) = broadcast::channel(observer_capacity.max(1));
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            topic_locks: Mutex::new(HashMap::new()),
            replay: Mutex::new(ReplayState {
                last_sequence: 0,
                buffer: ReplayBuffer::new(replay_capacity),
            }),
            observers,
            next_subscription: AtomicU64::new(1),
            handler_faults: AtomicU64::new(0),
        }
    }

    /// Create a bus with default capacities
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY, DEFAULT_OBSERVER_CAPACITY)
    }

    /// Publish with the core source; see [`EventBus::publish_from`]
    pub async fn publish(&self, topic: impl Into<Topic>, payload: Payload) -> u64 {
        self.publish_from(topic, CORE_SOURCE, payload).await
    }

    /// Publish an event and deliver it to every subscriber of its topic
    ///
    /// Returns once all handlers have run. The returned sequence id is also the
    /// event's position in the replay buffer.
    pub async fn publish_from(&self, topic: impl Into<Topic>, source: impl Into<String>, payload: Payload) -> u64 {
        let topic = topic.into();
        let source = source.into();
        debug!(%topic, %source, "EventBus::publish_from: called");

        let (event, faults) = self.dispatch(topic, source, payload).await;
        for fault in faults {
            self.report_fault(&event, fault).await;
        }
        event.sequence_id
    }

    /// Register a handler for a topic; handlers run in registration order
    pub fn subscribe(&self, topic: impl Into<Topic>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        debug!(%topic, %id, "EventBus::subscribe: new subscriber");
        self.subscriptions
            .write()
            .entry(topic)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Remove a subscription; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        debug!(%id, "EventBus::unsubscribe: called");
        let mut subscriptions = self.subscriptions.write();
        let mut removed = false;
        for handlers in subscriptions.values_mut() {
            let before = handlers.len();
            handlers.retain(|s| s.id != id);
            removed |= handlers.len() != before;
        }
        subscriptions.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Receive every event published from now on
    ///
    /// Lagging receivers lose events; use [`EventBus::attach`] to resume.
    pub fn watch(&self) -> broadcast::Receiver<Event> {
        debug!("EventBus::watch: new observer");
        self.observers.subscribe()
    }

    /// Reconnect an observer: backlog since `since` plus a gap-free live stream
    pub fn attach(&self, since: Option<u64>) -> Result<Attachment, ReplayGap> {
        debug!(?since, "EventBus::attach: called");
        // Events are appended and broadcast under this lock, so the receiver
        // created here sees exactly the events after the snapshot.
        let replay = self.replay.lock();
        let backlog = replay.buffer.snapshot(since)?;
        let live = self.observers.subscribe();
        let cursor = backlog.last().map(|e| e.sequence_id).or(since).unwrap_or(0);
        Ok(Attachment { backlog, live, cursor })
    }

    /// Snapshot of the replay buffer
    pub fn snapshot(&self, since: Option<u64>) -> Result<Vec<Event>, ReplayGap> {
        self.replay.lock().buffer.snapshot(since)
    }

    /// Sequence id of the most recently published event (0 when none)
    pub fn last_sequence_id(&self) -> u64 {
        self.replay.lock().last_sequence
    }

    /// Number of handlers subscribed to a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .get(&Topic::from(topic))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        let (published, retained, replay_capacity) = {
            let replay = self.replay.lock();
            (replay.last_sequence, replay.buffer.len(), replay.buffer.capacity())
        };
        BusStats {
            published,
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            observers: self.observers.receiver_count(),
            subscriptions: self.subscriptions.read().values().map(Vec::len).sum(),
            retained,
            replay_capacity,
        }
    }

    fn topic_lock(&self, topic: &Topic) -> Arc<tokio::sync::Mutex<()>> {
        self.topic_locks.lock().entry(topic.clone()).or_default().clone()
    }

    /// Record the event and run the topic's handlers while holding the topic lock
    async fn dispatch(&self, topic: Topic, source: String, payload: Payload) -> (Event, Vec<HandlerFault>) {
        let lock = self.topic_lock(&topic);
        let _guard = lock.lock().await;

        let event = self.record(topic, source, payload);
        let handlers = self.subscriptions.read().get(&event.topic).cloned().unwrap_or_default();

        let mut faults = Vec::new();
        for subscription in handlers {
            let outcome = AssertUnwindSafe(subscription.handler.handle(&event)).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            faults.push(HandlerFault {
                subscription: subscription.id,
                error,
            });
        }
        (event, faults)
    }

    /// Assign the next sequence id, append to the replay buffer, notify observers
    fn record(&self, topic: Topic, source: String, mut payload: Payload) -> Event {
        let timestamp = Utc::now();
        payload
            .entry("timestamp")
            .or_insert_with(|| Value::String(timestamp.to_rfc3339()));

        let mut replay = self.replay.lock();
        replay.last_sequence += 1;
        let event = Event {
            topic,
            payload,
            source,
            timestamp,
            sequence_id: replay.last_sequence,
        };
        replay.buffer.append(event.clone());
        // No observers is fine
        let _ = self.observers.send(event.clone());
        event
    }

    async fn report_fault(&self, event: &Event, fault: HandlerFault) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
        warn!(
            topic = %event.topic,
            sequence_id = event.sequence_id,
            subscription = %fault.subscription,
            error = %fault.error,
            "Event handler failed"
        );

        // Faults of fault handlers are only logged
        if event.topic == topics::HANDLER_FAULT {
            return;
        }

        let payload = match json!({
            "topic": event.topic,
            "sequence_id": event.sequence_id,
            "subscription_id": fault.subscription.to_string(),
            "error": fault.error,
        }) {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        let (fault_event, nested) = self
            .dispatch(Topic::from(topics::HANDLER_FAULT), BUS_SOURCE.to_string(), payload)
            .await;
        for nested in nested {
            self.handler_faults.fetch_add(1, Ordering::Relaxed);
            warn!(
                sequence_id = fault_event.sequence_id,
                subscription = %nested.subscription,
                error = %nested.error,
                "Fault handler failed"
            );
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
