//! Synchronous request bridge over asynchronous replies.
//!
//! A worker that needs an answer from the other side of a transport
//! registers a key, sends its packet, then blocks on a `Condvar` until the
//! dispatcher context delivers the matching reply with [`SyncBridge::respond`]
//! or the deadline passes.
//!
//! ```text
//!  worker thread                      dispatcher context
//!  ─────────────                      ──────────────────
//!  ticket = bridge.register(key)
//!  link.write(request)  ───────────▶  reply decoded
//!  ticket.wait(timeout) ◀───────────  bridge.respond(key, bytes)
//! ```
//!
//! One slot per key. Registering a key that already has a waiter replaces
//! it; the older waiter wakes with [`SyncError::Superseded`]. Replies for
//! keys nobody is waiting on are discarded.

use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, warn};

use crate::error::SyncError;

struct Slot {
    generation: u64,
    result: Option<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

/// Shared rendezvous between worker threads and the dispatcher.
#[derive(Default)]
pub struct SyncBridge {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl SyncBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a pending slot for `key`. Send the request after this returns.
    pub fn register(self: &Arc<Self>, key: &str) -> PendingTicket {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let replaced = inner
            .slots
            .insert(
                key.to_owned(),
                Slot {
                    generation,
                    result: None,
                },
            )
            .is_some();
        drop(inner);
        if replaced {
            warn!("SYNC: request '{}' replaced an earlier one", key);
            self.ready.notify_all();
        }
        PendingTicket {
            bridge: Arc::clone(self),
            key: key.to_owned(),
            generation,
        }
    }

    /// Register and wait in one call, for callers with nothing to send.
    pub fn request(self: &Arc<Self>, key: &str, timeout: Duration) -> Result<Vec<u8>, SyncError> {
        self.register(key).wait(timeout)
    }

    /// Deliver a reply. Returns `false` when no request is pending.
    pub fn respond(&self, key: &str, data: &[u8]) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(key) else {
            debug!("SYNC: no pending request for '{}', reply dropped", key);
            return false;
        };
        slot.result = Some(data.to_vec());
        drop(inner);
        self.ready.notify_all();
        true
    }

    /// Whether a request for `key` is currently waiting.
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().slots.contains_key(key)
    }
}

/// Handle for one registered request. Dropping it without waiting
/// releases the slot.
pub struct PendingTicket {
    bridge: Arc<SyncBridge>,
    key: String,
    generation: u64,
}

impl PendingTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until the reply arrives, the deadline passes, or a newer
    /// request for the same key replaces this one.
    pub fn wait(self, timeout: Duration) -> Result<Vec<u8>, SyncError> {
        let deadline = Instant::now() + timeout;
        let bridge = Arc::clone(&self.bridge);
        let mut inner = bridge.lock();
        loop {
            match inner.slots.get_mut(&self.key) {
                Some(slot) if slot.generation == self.generation => {
                    if let Some(data) = slot.result.take() {
                        inner.slots.remove(&self.key);
                        return Ok(data);
                    }
                }
                _ => return Err(SyncError::Superseded),
            }

            let now = Instant::now();
            if now >= deadline {
                inner.slots.remove(&self.key);
                debug!("SYNC: '{}' timed out", self.key);
                return Err(SyncError::Timeout);
            }
            inner = bridge
                .ready
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        let mut inner = self.bridge.lock();
        if inner
            .slots
            .get(&self.key)
            .is_some_and(|s| s.generation == self.generation)
        {
            inner.slots.remove(&self.key);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
