//! Bounded FIFO of publishes made while the session is down.

use std::{collections::VecDeque, time::Instant};

use bytes::Bytes;

use crate::transport::PublishOptions;

/// A publish waiting for the session to come back.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub options: PublishOptions,
    pub queued_at: Instant,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes, options: PublishOptions) -> Self {
        Self {
            topic: topic.into(),
            payload,
            options,
            queued_at: Instant::now(),
        }
    }
}

/// What [`OfflineQueue::push`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest entry.
    QueuedDroppedOldest,
    /// Queue full and configured to reject new entries.
    Rejected,
}

/// Never holds more than `capacity` messages.
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
    drop_oldest: bool,
    dropped: u64,
}

impl OfflineQueue {
    /// `capacity` of zero is raised to one.
    pub fn new(capacity: usize, drop_oldest: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            drop_oldest,
            dropped: 0,
        }
    }

    pub fn push(&mut self, message: QueuedMessage) -> PushOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(message);
            return PushOutcome::Queued;
        }

        self.dropped += 1;
        if self.drop_oldest {
            self.items.pop_front();
            self.items.push_back(message);
            PushOutcome::QueuedDroppedOldest
        } else {
            PushOutcome::Rejected
        }
    }

    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    /// Puts back a message whose send failed, ahead of everything else.
    /// Capacity still holds: the newest entry is evicted if needed.
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        if self.items.len() >= self.capacity {
            self.items.pop_back();
            self.dropped += 1;
        }
        self.items.push_front(message);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted or rejected since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Topics in queue order, for diagnostics.
    pub fn topics(&self) -> Vec<String> {
        self.items.iter().map(|m| m.topic.clone()).collect()
    }
}
