//! Progress hub — topic-based fan-out to interactive observers.
//!
//! Publishers never block: each subscriber owns a bounded outbound
//! buffer, and a subscriber that falls behind is evicted (its channel
//! dropped, which the transport layer sees as a close). Messages from
//! one publisher to one topic reach each surviving subscriber in
//! publish order; nothing is guaranteed across topics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{EventSink, ScanEvent};

/// Topic naming conventions.
pub fn job_topic(job_id: &str) -> String {
    format!("job:{job_id}")
}

pub fn session_topic(session_id: &str) -> String {
    format!("session:{session_id}")
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// A live subscription. Dropping the receiver is equivalent to leaving;
/// the hub notices on its next publish to the topic.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub topic: String,
    pub rx: mpsc::Receiver<String>,
}

#[derive(Debug)]
pub struct ProgressHub {
    buffer: usize,
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl ProgressHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(topic, subscriber = id, "subscriber registered");
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    pub fn unsubscribe(&self, subscriber_id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        for subscribers in topics.values_mut() {
            subscribers.retain(|s| s.id != subscriber_id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Broadcast to a topic. Full or closed buffers evict the subscriber
    /// rather than slowing the publisher down.
    pub fn publish(&self, topic: &str, event: &ScanEvent) {
        let Ok(message) = serde_json::to_string(event) else {
            warn!(topic, "unserializable event dropped");
            return;
        };
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|subscriber| match subscriber.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, subscriber = subscriber.id, "slow subscriber evicted");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(topic, subscriber = subscriber.id, "subscriber gone");
                false
            }
        });
        if subscribers.is_empty() {
            topics.remove(topic);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// [`EventSink`] bound to one topic of a hub — what the worker pool
/// hands the scheduler so the scheduler never learns about the hub.
#[derive(Debug, Clone)]
pub struct HubSink {
    hub: std::sync::Arc<ProgressHub>,
    topic: String,
}

impl HubSink {
    pub fn new(hub: std::sync::Arc<ProgressHub>, topic: impl Into<String>) -> Self {
        Self {
            hub,
            topic: topic.into(),
        }
    }
}

impl EventSink for HubSink {
    fn emit(&self, event: ScanEvent) {
        self.hub.publish(&self.topic, &event);
    }
}
