//! Acknowledgement correlation
//!
//! Each peer keeps an outstanding-ack table keyed by a monotonic 32-bit id.
//! Completion always routes through the table: either the matching ACK
//! frame arrives, or the per-entry timer fires with the synthesized
//! `ack_timeout` payload. For every registered ack exactly one of the two
//! happens, exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::codes;

/// Stable code carried in synthesized ack-timeout payloads
pub const ACK_TIMEOUT_CODE: &str = "ERR_ACK_001";

/// Resolver invoked with the ack payload, or with the timeout payload
pub type AckCallback = Box<dyn FnOnce(Value) + Send + 'static>;

/// Payload delivered when an ack never arrives
pub fn timeout_payload() -> Value {
    json!({ "error": codes::ACK_TIMEOUT, "code": ACK_TIMEOUT_CODE })
}

struct PendingAck {
    callback: AckCallback,
    timer: Option<JoinHandle<()>>,
}

struct AckInner {
    next_id: u32,
    pending: HashMap<u32, PendingAck>,
}

/// Outstanding-ack table for a single sender.
///
/// Ids are monotonic and wrap at `u32::MAX`; an id still outstanding is
/// skipped, so an id never collides with a live entry. Each peer owns an
/// independent registry (client and server counters are unrelated).
#[derive(Clone)]
pub struct AckRegistry {
    inner: Arc<Mutex<AckInner>>,
    timeout: Duration,
}

impl AckRegistry {
    /// Create a registry whose entries expire after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AckInner {
                next_id: 1,
                pending: HashMap::new(),
            })),
            timeout,
        }
    }

    #[cfg(test)]
    fn with_next_id(timeout: Duration, next_id: u32) -> Self {
        let registry = Self::new(timeout);
        registry.lock().next_id = next_id;
        registry
    }

    fn lock(&self) -> MutexGuard<'_, AckInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an id, store the callback, and start the timeout timer.
    ///
    /// Must be called from within a tokio runtime (the timer is a task).
    pub fn register(&self, callback: AckCallback) -> u32 {
        let id = self.insert(callback);
        self.arm(id);
        id
    }

    /// Allocate an id and store the callback without starting the timer.
    ///
    /// Used for frames parked in an offline queue: the timeout clock only
    /// starts when the frame is actually sent, via [`AckRegistry::arm`].
    pub fn register_unarmed(&self, callback: AckCallback) -> u32 {
        self.insert(callback)
    }

    fn insert(&self, callback: AckCallback) -> u32 {
        let mut inner = self.lock();
        let mut id = inner.next_id;
        // Skip ids that are still outstanding after a wrap
        while inner.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);
        inner.pending.insert(
            id,
            PendingAck {
                callback,
                timer: None,
            },
        );
        id
    }

    /// Start the timeout timer for an unarmed entry. No-op for unknown ids
    /// and for entries already armed.
    pub fn arm(&self, id: u32) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.timeout;
        let mut inner = self.lock();
        let Some(entry) = inner.pending.get_mut(&id) else {
            return;
        };
        if entry.timer.is_some() {
            return;
        }
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, id);
        }));
    }

    /// Complete an outstanding ack with the peer's payload.
    ///
    /// Returns `false` when the id is unknown (already completed, timed
    /// out, or never issued by this sender).
    pub fn complete(&self, id: u32, payload: Value) -> bool {
        let entry = self.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                (entry.callback)(payload);
                true
            }
            None => false,
        }
    }

    /// Fail one entry immediately with the timeout payload.
    ///
    /// Used when a queued frame is evicted before it was ever sent.
    pub fn fail(&self, id: u32) {
        if let Some(entry) = self.lock().pending.remove(&id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            (entry.callback)(timeout_payload());
        }
    }

    /// Cancel all timers and fail every outstanding entry with the timeout
    /// payload. Called when the owning connection closes, so that every
    /// registered callback still fires exactly once.
    pub fn shutdown(&self) {
        let drained: Vec<PendingAck> = {
            let mut inner = self.lock();
            inner.pending.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            (entry.callback)(timeout_payload());
        }
    }

    /// Number of outstanding acks
    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }
}

fn expire(weak: &Weak<Mutex<AckInner>>, id: u32) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let entry = inner
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pending
        .remove(&id);
    if let Some(entry) = entry {
        debug!(ack_id = id, "ack timed out");
        (entry.callback)(timeout_payload());
    }
}

/// One-shot responder handed to handlers for frames that requested an ack.
///
/// Calling [`AckReply::reply`] more than once is a no-op after the first;
/// never calling it simply lets the sender's timer fire.
pub struct AckReply {
    send: Mutex<Option<Box<dyn FnOnce(Value) + Send>>>,
}

impl AckReply {
    /// Wrap the transport-specific send of the ACK frame
    pub fn new(send: impl FnOnce(Value) + Send + 'static) -> Self {
        Self {
            send: Mutex::new(Some(Box::new(send))),
        }
    }

    /// Send the ack payload back to the requesting peer
    pub fn reply(&self, payload: Value) {
        let send = self.send.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(send) = send {
            send(payload);
        }
    }

    /// Whether a reply has already been sent
    pub fn is_consumed(&self) -> bool {
        self.send.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn capture() -> (AckCallback, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(move |v| drop(tx.send(v))), rx)
    }

    #[tokio::test]
    async fn test_complete_invokes_callback_once() {
        let registry = AckRegistry::new(Duration::from_secs(30));
        let (cb, mut rx) = capture();
        let id = registry.register(cb);

        assert!(registry.complete(id, json!({"ok": true})));
        assert_eq!(rx.recv().await.unwrap(), json!({"ok": true}));

        // Second completion finds nothing
        assert!(!registry.complete(id, json!({"ok": false})));
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_with_timeout_payload() {
        let registry = AckRegistry::new(Duration::from_secs(30));
        let (cb, mut rx) = capture();
        let id = registry.register(cb);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["error"], "ack_timeout");
        assert_eq!(payload["code"], ACK_TIMEOUT_CODE);

        // The id is freed after the timeout
        assert_eq!(registry.outstanding(), 0);
        assert!(!registry.complete(id, json!(null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_timer() {
        let registry = AckRegistry::new(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let id = registry.register(Box::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.complete(id, json!(1)));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_entry_does_not_expire_until_armed() {
        let registry = AckRegistry::new(Duration::from_secs(5));
        let (cb, mut rx) = capture();
        let id = registry.register_unarmed(cb);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.outstanding(), 1);

        registry.arm(id);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await.unwrap()["error"], "ack_timeout");
    }

    #[tokio::test]
    async fn test_id_wraps_and_skips_outstanding() {
        let registry = AckRegistry::with_next_id(Duration::from_secs(30), u32::MAX);
        let (cb1, _rx1) = capture();
        let (cb2, _rx2) = capture();
        let (cb3, _rx3) = capture();

        let a = registry.register_unarmed(cb1);
        let b = registry.register_unarmed(cb2);
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 0);

        // Force the counter back onto the still-outstanding id
        registry.lock().next_id = u32::MAX;
        let c = registry.register_unarmed(cb3);
        assert_eq!(c, 1, "wrapped allocation must skip live ids");
    }

    #[tokio::test]
    async fn test_shutdown_fails_everything_once() {
        let registry = AckRegistry::new(Duration::from_secs(30));
        let (cb1, mut rx1) = capture();
        let (cb2, mut rx2) = capture();
        registry.register(cb1);
        registry.register(cb2);

        registry.shutdown();
        assert_eq!(rx1.recv().await.unwrap()["error"], "ack_timeout");
        assert_eq!(rx2.recv().await.unwrap()["error"], "ack_timeout");
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_ack_reply_is_one_shot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let reply = AckReply::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!reply.is_consumed());
        reply.reply(json!({"ok": true}));
        reply.reply(json!({"ok": false}));
        assert!(reply.is_consumed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
