//! Pending-request table: correlates in-flight requests with the
//! responses that arrive for them, by serial number.
//!
//! Resolution is single-assignment: whichever path removes the entry from
//! the map (complete, fail, cancel, expiry sweep, fail_all) owns its
//! oneshot sender, so every other path racing against it finds no entry
//! and is a safe no-op. The awaiting caller observes exactly one outcome.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::GatelinkError;
use crate::frame::PUSH_SERIAL;

/// Terminal outcome of one pending request.
#[derive(Debug)]
pub enum Outcome {
    /// Response body from the gateway.
    Payload(Bytes),
    /// Typed failure (timeout, disconnect, cancellation).
    Failed(GatelinkError),
}

struct Entry {
    expected_protocol_id: u32,
    deadline: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Outcome>,
}

/// Handle the issuing caller awaits on.
pub type AwaitHandle = oneshot::Receiver<Outcome>;

/// Table of requests awaiting a response, keyed by serial number.
///
/// Serial numbers increase monotonically and skip 0 (reserved for pushes);
/// a serial is never reused while still pending.
pub struct PendingTable {
    entries: DashMap<u32, Entry>,
    next_serial: AtomicU32,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            next_serial: AtomicU32::new(1),
        })
    }

    /// Allocate a serial, store the entry, arm its deadline.
    pub fn register(&self, expected_protocol_id: u32, timeout: Duration) -> (u32, AwaitHandle) {
        let serial = self.alloc_serial();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            serial,
            Entry {
                expected_protocol_id,
                deadline: Instant::now() + timeout,
                timeout,
                tx,
            },
        );
        (serial, rx)
    }

    fn alloc_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            // Wraps past u32::MAX back to 0; skip the push sentinel and
            // anything still pending from four billion requests ago.
            if serial != PUSH_SERIAL && !self.entries.contains_key(&serial) {
                return serial;
            }
        }
    }

    /// Resolve a pending request with a response payload.
    ///
    /// A response for an unknown or already-resolved serial is logged and
    /// discarded: under a timeout/late-delivery race this is legitimate,
    /// not an error. A response whose protocol id does not match the one
    /// the request expects leaves the entry pending.
    pub fn complete(&self, serial: u32, protocol_id: u32, payload: Bytes) {
        match self.entries.remove_if(&serial, |_, e| e.expected_protocol_id == protocol_id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Outcome::Payload(payload));
            }
            None if self.entries.contains_key(&serial) => {
                warn!(
                    serial,
                    protocol_id, "response protocol id does not match pending request; dropped"
                );
            }
            None => {
                debug!(serial, protocol_id, "late or unknown response discarded");
            }
        }
    }

    /// Resolve a pending request with an explicit failure.
    pub fn fail(&self, serial: u32, reason: GatelinkError) {
        if let Some((_, entry)) = self.entries.remove(&serial) {
            let _ = entry.tx.send(Outcome::Failed(reason));
        }
    }

    /// Cooperative cancellation: unblocks the waiter, does not retract the
    /// request already on the wire. A late response for this serial will
    /// be discarded by [`PendingTable::complete`].
    pub fn cancel(&self, serial: u32) {
        self.fail(serial, GatelinkError::Cancelled);
    }

    /// Sweep out every entry whose deadline has passed, resolving each
    /// with its own `Timeout` failure.
    pub fn expire(&self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();
        for serial in expired {
            // Re-check under removal; a response may have landed between
            // the scan and here.
            if let Some((_, entry)) = self.entries.remove_if(&serial, |_, e| e.deadline <= now) {
                debug!(serial, "pending request expired");
                let timeout = entry.timeout;
                let _ = entry.tx.send(Outcome::Failed(GatelinkError::Timeout(timeout)));
            }
        }
    }

    /// Resolve every pending entry with the given disconnect reason and
    /// clear the table. Used when a channel leaves READY.
    pub fn fail_all(&self, reason: &str) {
        let serials: Vec<u32> = self.entries.iter().map(|e| *e.key()).collect();
        for serial in serials {
            if let Some((_, entry)) = self.entries.remove(&serial) {
                let _ = entry
                    .tx
                    .send(Outcome::Failed(GatelinkError::Disconnected(reason.to_string())));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<PendingTable> {
        PendingTable::new()
    }

    #[tokio::test]
    async fn serials_are_positive_and_distinct() {
        let t = table();
        let (a, _ra) = t.register(1, Duration::from_secs(1));
        let (b, _rb) = t.register(1, Duration::from_secs(1));
        assert_ne!(a, PUSH_SERIAL);
        assert_ne!(b, PUSH_SERIAL);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn permuted_completion_order_has_no_cross_talk() {
        let t = table();
        let mut handles = Vec::new();
        for i in 0..16u32 {
            let (serial, rx) = t.register(100 + i, Duration::from_secs(5));
            handles.push((serial, 100 + i, rx));
        }
        // Resolve in reverse issue order.
        for (serial, proto, _) in handles.iter().rev() {
            t.complete(*serial, *proto, Bytes::from(format!("payload-{serial}")));
        }
        for (serial, _, rx) in handles {
            match rx.await.unwrap() {
                Outcome::Payload(body) => {
                    assert_eq!(body.as_ref(), format!("payload-{serial}").as_bytes());
                }
                other => panic!("expected payload, got {other:?}"),
            }
        }
        assert!(t.is_empty());
    }

    #[tokio::test]
    async fn protocol_id_mismatch_leaves_entry_pending() {
        let t = table();
        let (serial, rx) = t.register(10, Duration::from_secs(5));
        t.complete(serial, 11, Bytes::from_static(b"wrong schema"));
        assert_eq!(t.len(), 1);
        t.complete(serial, 10, Bytes::from_static(b"right"));
        match rx.await.unwrap() {
            Outcome::Payload(body) => assert_eq!(body.as_ref(), b"right"),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_resolves_once_and_late_complete_is_noop() {
        let t = table();
        let (serial, rx) = t.register(1, Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(60)).await;
        t.expire();
        match rx.await.unwrap() {
            Outcome::Failed(GatelinkError::Timeout(d)) => {
                assert_eq!(d, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // Late delivery after expiry: silently discarded.
        t.complete(serial, 1, Bytes::from_static(b"too late"));
        assert!(t.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_spares_entries_still_within_deadline() {
        let t = table();
        let (_s1, rx1) = t.register(1, Duration::from_millis(50));
        let (s2, rx2) = t.register(1, Duration::from_secs(10));
        tokio::time::advance(Duration::from_millis(60)).await;
        t.expire();
        assert!(matches!(rx1.await.unwrap(), Outcome::Failed(GatelinkError::Timeout(_))));
        assert_eq!(t.len(), 1);
        t.complete(s2, 1, Bytes::from_static(b"ok"));
        assert!(matches!(rx2.await.unwrap(), Outcome::Payload(_)));
    }

    #[tokio::test]
    async fn fail_all_drains_the_table() {
        let t = table();
        let mut rxs = Vec::new();
        for _ in 0..8 {
            let (_, rx) = t.register(1, Duration::from_secs(5));
            rxs.push(rx);
        }
        t.fail_all("transport lost");
        for rx in rxs {
            match rx.await.unwrap() {
                Outcome::Failed(GatelinkError::Disconnected(reason)) => {
                    assert_eq!(reason, "transport lost");
                }
                other => panic!("{other:?}"),
            }
        }
        assert!(t.is_empty());
    }

    #[tokio::test]
    async fn cancel_unblocks_waiter_and_tolerates_late_response() {
        let t = table();
        let (serial, rx) = t.register(1, Duration::from_secs(5));
        t.cancel(serial);
        assert!(matches!(rx.await.unwrap(), Outcome::Failed(GatelinkError::Cancelled)));
        t.complete(serial, 1, Bytes::from_static(b"late"));
        assert!(t.is_empty());
    }
}
