//! Per-agent event queues
//!
//! The admin side publishes tunnel lifecycle events; the broker's control
//! session for that agent consumes them in order.

use dashmap::DashMap;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use std::sync::Arc;

/// Events queued per agent
const EVENT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Register the tunnel and ask the agent to connect it
    OpenTunnel(String),
    /// Deregister the tunnel and ask the agent to close it
    CloseTunnel(String),
    /// Tell the agent to shut down and drop its control session
    RejectAgent,
}

/// Agent-keyed pub/sub. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PubSub {
    subscribers: Arc<DashMap<String, AsyncSender<Event>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `agent`. An earlier subscription for the same agent is closed.
    pub fn subscribe(&self, agent: &str) -> AsyncReceiver<Event> {
        let (tx, rx) = bounded_async(EVENT_QUEUE_CAPACITY);
        if let Some(previous) = self.subscribers.insert(agent.to_string(), tx) {
            let _ = previous.close();
        }
        rx
    }

    pub fn unsubscribe(&self, agent: &str) {
        if let Some((_, tx)) = self.subscribers.remove(agent) {
            let _ = tx.close();
        }
    }

    pub fn is_subscribed(&self, agent: &str) -> bool {
        self.subscribers.contains_key(agent)
    }

    /// Deliver `events` in order. Does nothing when `agent` has no subscriber.
    ///
    /// Waits while the queue is full.
    pub async fn publish(&self, agent: &str, events: impl IntoIterator<Item = Event>) {
        let Some(tx) = self.subscribers.get(agent).map(|entry| entry.value().clone()) else {
            return;
        };
        for event in events {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}
