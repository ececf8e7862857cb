//! Pending-callback bookkeeping for one session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// One outstanding request awaiting its `[3, id, [..]]` reply.
struct PendingEntry {
    tx: oneshot::Sender<Vec<Value>>,
    expires_at: Instant,
}

/// Request-id allocation and response matching.
///
/// Ids are monotonic within a session and shared between plain messages and
/// callback requests. Token rotation resets allocation to 0.
pub struct PendingTable {
    next_id: u64,
    expiry: Duration,
    entries: HashMap<u64, PendingEntry>,
}

impl PendingTable {
    pub fn new(expiry: Duration) -> Self {
        Self { next_id: 0, expiry, entries: HashMap::new() }
    }

    /// Allocate the next request id without registering a reply slot.
    pub fn next_message_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocate an id and register a reply channel for it.
    pub fn register(&mut self) -> (u64, oneshot::Receiver<Vec<Value>>) {
        let id = self.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, PendingEntry { tx, expires_at: Instant::now() + self.expiry });
        (id, rx)
    }

    /// Deliver a reply and opportunistically sweep expired entries.
    pub fn complete(&mut self, id: u64, args: Vec<Value>) {
        match self.entries.remove(&id) {
            Some(entry) => {
                let _ = entry.tx.send(args);
            }
            None => debug!(id, "Reply for unknown callback id"),
        }
        self.sweep(Instant::now());
    }

    /// Drop entries past their expiry horizon. Their awaiters observe the
    /// dropped sender.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Drop all entries, keeping the id counter. Used when the socket dies.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop all entries and restart id allocation from 0. Used on token
    /// rotation, which replaces the socket underneath the session.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_id = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
