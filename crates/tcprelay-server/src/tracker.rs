//! Registry of live sessions, used for graceful shutdown.
//!
//! Holds each session's cancel handle plus a count of connection tasks still
//! in flight (admission, dialing or relaying). On shutdown the server cancels
//! every live session and waits for all connection tasks to finish. A session
//! that registers after shutdown began is cancelled on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcprelay_core::{CancelHandle, SessionId};
use tokio::sync::{Notify, RwLock};
use tokio::time;
use tracing::debug;

/// Live sessions indexed by id.
#[derive(Default)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<SessionId, CancelHandle>>,
    /// Connection tasks that have not finished yet.
    connections: AtomicUsize,
    closing: AtomicBool,
    /// Woken whenever the last connection task finishes.
    drained: Notify,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one connection task as in flight until the slot is dropped.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionSlot {
        self.connections.fetch_add(1, Ordering::SeqCst);
        ConnectionSlot {
            tracker: self.clone(),
        }
    }

    pub async fn register(&self, id: SessionId, handle: CancelHandle) {
        let mut sessions = self.sessions.write().await;
        if self.closing.load(Ordering::SeqCst) {
            debug!(session_id = %id, "shutting down, cancelling new session");
            handle.cancel();
        }
        sessions.insert(id, handle);
        debug!(session_id = %id, "session registered");
    }

    pub async fn unregister(&self, id: SessionId) {
        if self.sessions.write().await.remove(&id).is_some() {
            debug!(session_id = %id, "session unregistered");
        }
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Raise the cancellation signal of every live session, and of every
    /// session registered from now on. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        // Set before taking the lock: a concurrent register either sees the
        // flag or is already in the map swept below.
        self.closing.store(true, Ordering::SeqCst);
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.cancel();
        }
        sessions.len()
    }

    /// Wait until no connection task is in flight, for at most `grace`.
    /// Returns `false` if some were still running when the grace period ran
    /// out.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                // Register interest before checking, so a slot dropped in
                // between is not missed.
                let notified = self.drained.notified();
                if self.connections.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(grace, wait).await.is_ok()
    }
}

/// An in-flight connection task. Dropping it marks the task finished.
pub struct ConnectionSlot {
    tracker: Arc<SessionTracker>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if self.tracker.connections.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}
