//! Topic-based publish/subscribe for pipeline observers.
//!
//! Publishing clones the envelope into one unbounded channel per live
//! subscriber, so a stalled observer can never back-pressure the pipeline.
//! Each subscriber sees events in publish order; no ordering is promised
//! across subscribers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};
use toolgate_core::{EventEnvelope, GateEvent, Topic};

#[derive(Default)]
struct Subscribers {
    by_topic: HashMap<Topic, Vec<Sender<EventEnvelope>>>,
    all: Vec<Sender<EventEnvelope>>,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published to `topic`, in publish order.
    pub fn subscribe(&self, topic: Topic) -> Receiver<EventEnvelope> {
        let (tx, rx) = channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_topic.entry(topic).or_default().push(tx);
        rx
    }

    /// Receive every event regardless of topic (audit loggers, UIs).
    pub fn subscribe_all(&self) -> Receiver<EventEnvelope> {
        let (tx, rx) = channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.all.push(tx);
        rx
    }

    pub fn publish(&self, kind: GateEvent) -> EventEnvelope {
        let envelope = EventEnvelope::now(kind);
        self.publish_envelope(envelope.clone());
        envelope
    }

    /// Sends on unbounded channels never block; subscribers whose receiver
    /// hung up are pruned here.
    pub fn publish_envelope(&self, envelope: EventEnvelope) {
        let topic = envelope.kind.topic();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = inner.by_topic.get_mut(&topic) {
            senders.retain(|tx| tx.send(envelope.clone()).is_ok());
        }
        inner.all.retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_topic.get(&topic).map_or(0, Vec::len)
    }
}
