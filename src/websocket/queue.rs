//! Per-connection outbound buffer used while a transport is not open.

use crate::types::ConnectionId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Frame text, already encoded.
    pub frame: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// What `drain` learned from the transport about one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    TransportClosed,
}

#[derive(Debug)]
pub struct MessageQueue {
    max_size: usize,
    queues: HashMap<ConnectionId, VecDeque<QueuedMessage>>,
}

impl MessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            queues: HashMap::new(),
        }
    }

    /// Appends a frame. When the queue is full the oldest entry is evicted and returned.
    pub fn enqueue(&mut self, id: &ConnectionId, frame: String) -> Option<QueuedMessage> {
        let queue = self.queues.entry(id.clone()).or_default();
        let evicted = if queue.len() >= self.max_size {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(QueuedMessage {
            frame,
            enqueued_at: Utc::now(),
            attempts: 0,
        });
        evicted
    }

    /// Hands frames to `send` oldest first. Stops at the first frame the
    /// transport refuses; that frame and everything behind it stay queued.
    pub fn drain<F>(&mut self, id: &ConnectionId, mut send: F) -> usize
    where
        F: FnMut(&QueuedMessage) -> Delivery,
    {
        let Some(queue) = self.queues.get_mut(id) else {
            return 0;
        };
        let mut sent = 0;
        while let Some(front) = queue.front_mut() {
            match send(front) {
                Delivery::Sent => {
                    queue.pop_front();
                    sent += 1;
                }
                Delivery::TransportClosed => {
                    front.attempts += 1;
                    break;
                }
            }
        }
        if queue.is_empty() {
            self.queues.remove(id);
        }
        sent
    }

    pub fn clear(&mut self, id: &ConnectionId) {
        self.queues.remove(id);
    }

    pub fn clear_all(&mut self) {
        self.queues.clear();
    }

    pub fn len(&self, id: &ConnectionId) -> usize {
        self.queues.get(id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, id: &ConnectionId) -> bool {
        self.len(id) == 0
    }

    pub fn pending(&self, id: &ConnectionId) -> Vec<QueuedMessage> {
        self.queues
            .get(id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SharedChannel;

    fn id() -> ConnectionId {
        ConnectionId::shared(SharedChannel::Events)
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = MessageQueue::default();
        for n in 0..5 {
            assert!(queue.enqueue(&id(), format!("m{}", n)).is_none());
        }

        let mut seen = Vec::new();
        let sent = queue.drain(&id(), |entry| {
            seen.push(entry.frame.clone());
            Delivery::Sent
        });
        assert_eq!(sent, 5);
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(queue.is_empty(&id()));
    }

    #[test]
    fn test_eviction_drops_oldest_and_caps_length() {
        let mut queue = MessageQueue::new(100);
        for n in 0..100 {
            queue.enqueue(&id(), n.to_string());
        }
        for n in 100..150 {
            let evicted = queue.enqueue(&id(), n.to_string()).expect("queue is full");
            assert_eq!(evicted.frame, (n - 100).to_string());
            assert_eq!(queue.len(&id()), 100);
        }
        let pending = queue.pending(&id());
        assert_eq!(pending.first().map(|m| m.frame.as_str()), Some("50"));
        assert_eq!(pending.last().map(|m| m.frame.as_str()), Some("149"));
    }

    #[test]
    fn test_drain_stops_when_transport_closes() {
        let mut queue = MessageQueue::default();
        for frame in ["a", "b", "c", "d"] {
            queue.enqueue(&id(), frame.to_string());
        }

        let mut budget = 2;
        let sent = queue.drain(&id(), |_| {
            if budget == 0 {
                return Delivery::TransportClosed;
            }
            budget -= 1;
            Delivery::Sent
        });
        assert_eq!(sent, 2);

        let pending = queue.pending(&id());
        let frames: Vec<_> = pending.iter().map(|m| m.frame.as_str()).collect();
        assert_eq!(frames, vec!["c", "d"]);
        assert_eq!(pending[0].attempts, 1);

        let mut rest = Vec::new();
        queue.drain(&id(), |entry| {
            rest.push(entry.frame.clone());
            Delivery::Sent
        });
        assert_eq!(rest, vec!["c", "d"]);
    }

    #[test]
    fn test_queues_are_per_connection() {
        let mut queue = MessageQueue::default();
        let other = ConnectionId::shared(SharedChannel::Metrics);
        queue.enqueue(&id(), "x".to_string());
        queue.enqueue(&other, "y".to_string());

        queue.clear(&id());
        assert!(queue.is_empty(&id()));
        assert_eq!(queue.len(&other), 1);

        queue.clear_all();
        assert!(queue.is_empty(&other));
        assert_eq!(queue.drain(&other, |_| Delivery::Sent), 0);
    }
}
