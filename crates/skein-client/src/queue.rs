//! Offline emit queue
//!
//! While the transport is down, emits park in a bounded FIFO. On
//! reconnect the queue is flushed oldest-first before any new emit goes
//! out. A full queue discards its oldest entry; entries also expire after
//! a TTL. Ack timers for queued frames only start at actual send time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

/// An emit parked while the transport was down
#[derive(Debug)]
pub struct QueuedEmit {
    /// Event name
    pub event: String,
    /// Event payload
    pub payload: Value,
    /// Pre-allocated (unarmed) ack id, when the caller wants an ack
    pub ack_id: Option<u32>,
    /// When the emit was parked
    pub queued_at: Instant,
}

/// Bounded FIFO of parked emits
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueuedEmit>,
    max: usize,
    ttl: Duration,
}

impl OfflineQueue {
    /// Queue holding at most `max` entries, each for at most `ttl`
    pub fn new(max: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max,
            ttl,
        }
    }

    /// Append an emit; returns the evicted oldest entry when full
    pub fn push(&mut self, emit: QueuedEmit) -> Option<QueuedEmit> {
        let evicted = if self.entries.len() >= self.max && self.max > 0 {
            self.entries.pop_front()
        } else if self.max == 0 {
            return Some(emit);
        } else {
            None
        };
        self.entries.push_back(emit);
        evicted
    }

    /// Drain the queue oldest-first, splitting entries that are still
    /// within their TTL from those that expired while parked.
    pub fn drain(&mut self, now: Instant) -> (Vec<QueuedEmit>, Vec<QueuedEmit>) {
        let mut fresh = Vec::new();
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.pop_front() {
            if now.duration_since(entry.queued_at) > self.ttl {
                expired.push(entry);
            } else {
                fresh.push(entry);
            }
        }
        (fresh, expired)
    }

    /// Put entries back at the head of the queue, preserving their order.
    /// Used when a flush fails mid-way. Returns entries evicted from the
    /// head to restore the capacity bound.
    pub fn requeue_front(&mut self, entries: Vec<QueuedEmit>) -> Vec<QueuedEmit> {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
        let mut evicted = Vec::new();
        while self.entries.len() > self.max {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            } else {
                break;
            }
        }
        evicted
    }

    /// Number of parked emits
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emit(n: u64, at: Instant) -> QueuedEmit {
        QueuedEmit {
            event: format!("e{n}"),
            payload: json!({ "n": n }),
            ack_id: None,
            queued_at: at,
        }
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = OfflineQueue::new(10, Duration::from_secs(300));
        let t0 = Instant::now();
        for n in 0..5 {
            assert!(queue.push(emit(n, t0)).is_none());
        }

        let (fresh, expired) = queue.drain(t0);
        assert!(expired.is_empty());
        let order: Vec<_> = fresh.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(order, ["e0", "e1", "e2", "e3", "e4"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_discards_oldest() {
        let mut queue = OfflineQueue::new(3, Duration::from_secs(300));
        let t0 = Instant::now();
        for n in 0..3 {
            queue.push(emit(n, t0));
        }
        let evicted = queue.push(emit(3, t0)).expect("oldest must be evicted");
        assert_eq!(evicted.event, "e0");
        assert_eq!(queue.len(), 3);

        let (fresh, _) = queue.drain(t0);
        let order: Vec<_> = fresh.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(order, ["e1", "e2", "e3"]);
    }

    #[test]
    fn test_expired_entries_split_out() {
        let ttl = Duration::from_secs(300);
        let mut queue = OfflineQueue::new(10, ttl);
        let t0 = Instant::now();
        queue.push(emit(0, t0));
        queue.push(emit(1, t0 + Duration::from_secs(200)));

        let later = t0 + Duration::from_secs(301);
        let (fresh, expired) = queue.drain(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].event, "e0");
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].event, "e1");
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut queue = OfflineQueue::new(10, Duration::from_secs(300));
        let t0 = Instant::now();
        queue.push(emit(2, t0));
        queue.push(emit(3, t0));

        let evicted = queue.requeue_front(vec![emit(0, t0), emit(1, t0)]);
        assert!(evicted.is_empty());
        let (fresh, _) = queue.drain(t0);
        let order: Vec<_> = fresh.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(order, ["e0", "e1", "e2", "e3"]);
    }

    #[test]
    fn test_requeue_front_trims_to_capacity() {
        let mut queue = OfflineQueue::new(2, Duration::from_secs(300));
        let t0 = Instant::now();
        queue.push(emit(2, t0));

        let evicted = queue.requeue_front(vec![emit(0, t0), emit(1, t0)]);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].event, "e0");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_zero_capacity_rejects_immediately() {
        let mut queue = OfflineQueue::new(0, Duration::from_secs(300));
        let t0 = Instant::now();
        let bounced = queue.push(emit(0, t0)).expect("entry must bounce");
        assert_eq!(bounced.event, "e0");
        assert!(queue.is_empty());
    }
}
