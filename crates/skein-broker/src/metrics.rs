//! Broker counters
//!
//! Plain atomics readable by a collector. The active-connection gauge
//! doubles as the admission cap: acquisition is a compare-and-swap, so
//! `max_connections` is never exceeded even under concurrent upgrades.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter set for a running broker
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    frames_dropped: AtomicU64,
    rate_limit_denials: AtomicU64,
    decode_errors: AtomicU64,
    handler_panics: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Upgrades accepted over process lifetime
    pub connections_accepted: u64,
    /// Upgrades rejected (unknown namespace or admission cap)
    pub connections_rejected: u64,
    /// Currently open sockets
    pub active_connections: u64,
    /// Frames decoded from the wire
    pub frames_in: u64,
    /// Frames written to the wire
    pub frames_out: u64,
    /// Outbound frames dropped on full socket queues
    pub frames_dropped: u64,
    /// Frames refused by the rate limiter
    pub rate_limit_denials: u64,
    /// Inbound frames that failed to decode
    pub decode_errors: u64,
    /// Handler invocations that panicked
    pub handler_panics: u64,
}

impl BrokerMetrics {
    /// Reserve an active-connection slot, refusing past `max`
    pub(crate) fn try_acquire_connection(&self, max: usize) -> bool {
        let acquired = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max as u64).then_some(n + 1)
            })
            .is_ok();
        if acquired {
            self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_rejected.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Release a slot taken by [`BrokerMetrics::try_acquire_connection`]
    pub(crate) fn release_connection(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "connection gauge underflow");
    }

    pub(crate) fn incr_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_frames_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_frames_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_frames_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_rate_limit_denials(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_handler_panics(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            rate_limit_denials: self.rate_limit_denials.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}
