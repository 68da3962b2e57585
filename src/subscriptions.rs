//! The supervisor's record of desired subscriptions.
//!
//! The record, not the broker, is the source of truth: entries survive
//! reconnects and are replayed in insertion order after every connect
//! acknowledgment until removed.

use std::{fmt, sync::Arc};

use rumqttc::QoS;

use crate::transport::{topic_matches, InboundMessage};

/// Per-topic message callback.
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// One desired subscription.
#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    pub handler: Option<MessageHandler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Ordered topic → subscription map.
#[derive(Debug, Default)]
pub struct SubscriptionRecord {
    entries: Vec<Subscription>,
}

impl SubscriptionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.iter().any(|s| s.topic == topic)
    }

    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.topic == topic)
    }

    /// Adds or replaces in place, keeping the original position.
    pub fn insert(&mut self, subscription: Subscription) {
        match self.entries.iter_mut().find(|s| s.topic == subscription.topic) {
            Some(existing) => *existing = subscription,
            None => self.entries.push(subscription),
        }
    }

    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        let index = self.entries.iter().position(|s| s.topic == topic)?;
        Some(self.entries.remove(index))
    }

    /// `(topic, qos)` pairs in insertion order.
    pub fn snapshot(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .map(|s| (s.topic.clone(), s.qos))
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|s| s.topic.clone()).collect()
    }

    /// Handlers whose filter matches `topic`, in insertion order.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.entries
            .iter()
            .filter(|s| topic_matches(&s.topic, topic))
            .filter_map(|s| s.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
