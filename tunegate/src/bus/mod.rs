//! In-process event bus.
//!
//! Best-effort pub/sub: each subscriber gets a bounded channel, publishing
//! never blocks, and an event that does not fit a subscriber's channel is
//! dropped for that subscriber (counted per topic). Nothing is persisted;
//! the store is the source of truth and subscribers that miss events catch
//! up by re-reading it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Static topic names.
pub mod topic {
    pub const SESSION_START: &str = "session.start";
    pub const SESSION_STOP: &str = "session.stop";
    pub const LEASE_LOST: &str = "lease.lost";
    pub const PIPELINE_TICK: &str = "pipeline.tick";

    pub const ALL: &[&str] = &[SESSION_START, SESSION_STOP, LEASE_LOST, PIPELINE_TICK];
}

/// Default per-subscriber channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events carried on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    SessionStart { session_id: Uuid },
    SessionStop { session_id: Uuid },
    LeaseLost { session_id: Uuid, slot: u32 },
    PipelineTick { session_id: Uuid },
}

impl BusEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => topic::SESSION_START,
            Self::SessionStop { .. } => topic::SESSION_STOP,
            Self::LeaseLost { .. } => topic::LEASE_LOST,
            Self::PipelineTick { .. } => topic::PIPELINE_TICK,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionStart { session_id }
            | Self::SessionStop { session_id }
            | Self::LeaseLost { session_id, .. }
            | Self::PipelineTick { session_id } => *session_id,
        }
    }
}

struct TopicState {
    subscribers: Vec<mpsc::Sender<BusEvent>>,
    dropped: AtomicU64,
}

impl TopicState {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            dropped: AtomicU64::new(0),
        }
    }
}

/// The bus handle; cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<&'static str, TopicState>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let mut topics = HashMap::new();
        for name in topic::ALL {
            topics.insert(*name, TopicState::new());
        }
        Self {
            topics: Arc::new(RwLock::new(topics)),
        }
    }

    /// Subscribe to a topic with the default channel capacity.
    pub fn subscribe(&self, topic: &'static str) -> mpsc::Receiver<BusEvent> {
        self.subscribe_with_capacity(topic, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Subscribe to a topic with a custom channel capacity.
    pub fn subscribe_with_capacity(
        &self,
        topic: &'static str,
        capacity: usize,
    ) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut topics = self.topics.write();
        topics
            .get_mut(topic)
            .unwrap_or_else(|| panic!("unknown bus topic: {topic}"))
            .subscribers
            .push(tx);
        rx
    }

    /// Publish an event to all current subscribers of its topic.
    ///
    /// Never blocks. Subscribers whose channel is full miss this event and
    /// the topic drop counter is incremented once per miss.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        let mut topics = self.topics.write();
        let Some(state) = topics.get_mut(topic) else {
            return;
        };
        state.subscribers.retain(|tx| !tx.is_closed());
        for tx in &state.subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(topic, "bus subscriber full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Number of events dropped so far for `topic`.
    pub fn dropped(&self, topic: &'static str) -> u64 {
        self.topics
            .read()
            .get(topic)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &'static str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_fifo_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(topic::SESSION_START);

        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            bus.publish(BusEvent::SessionStart { session_id: *id });
        }
        for id in &ids {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.session_id(), *id);
        }
    }

    #[tokio::test]
    async fn full_subscriber_drops_and_counts() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_with_capacity(topic::PIPELINE_TICK, 2);

        let id = Uuid::new_v4();
        for _ in 0..5 {
            bus.publish(BusEvent::PipelineTick { session_id: id });
        }
        assert_eq!(bus.dropped(topic::PIPELINE_TICK), 3);

        // The two buffered events are still delivered in order.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let bus = EventBus::new();
        let mut fast = bus.subscribe(topic::SESSION_STOP);
        let _slow = bus.subscribe_with_capacity(topic::SESSION_STOP, 1);

        let id = Uuid::new_v4();
        for _ in 0..3 {
            bus.publish(BusEvent::SessionStop { session_id: id });
        }
        // The slow subscriber dropped two; the fast one got all three.
        assert_eq!(bus.dropped(topic::SESSION_STOP), 2);
        for _ in 0..3 {
            assert!(fast.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(topic::LEASE_LOST);
        drop(rx);
        bus.publish(BusEvent::LeaseLost {
            session_id: Uuid::new_v4(),
            slot: 0,
        });
        assert_eq!(bus.subscriber_count(topic::LEASE_LOST), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(BusEvent::SessionStart {
            session_id: Uuid::new_v4(),
        });
        assert_eq!(bus.dropped(topic::SESSION_START), 0);
    }
}
