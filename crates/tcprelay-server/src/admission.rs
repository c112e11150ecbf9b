//! Admission control: caps the number of concurrent sessions.
//!
//! Checked right after accept and before the downstream dial, so a saturated
//! relay never opens extra outbound sockets. An admitted connection holds an
//! [`AdmissionGuard`] until its session task ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runtime session limiter with an atomic slot counter.
pub struct AdmissionController {
    /// Maximum concurrent sessions; 0 means unlimited.
    max_sessions: usize,
    /// Shared counter of currently admitted sessions.
    active: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a session slot if one is free.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` describing the limit when every slot is taken.
    pub fn try_admit(&self) -> Result<AdmissionGuard, String> {
        let limit = self.max_sessions;
        let taken = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (limit == 0 || current < limit).then_some(current + 1)
            });

        match taken {
            Ok(_) => Ok(AdmissionGuard {
                counter: self.active.clone(),
            }),
            Err(current) => Err(format!("session limit reached ({current}/{limit})")),
        }
    }

    /// Current number of admitted sessions.
    ///
    /// Approximate under concurrent admits/releases. Suitable for logging,
    /// not for synchronisation.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// RAII guard that frees the session slot on drop.
/// Owns an `Arc<AtomicUsize>` so it is `Send` and can be moved into spawned tasks.
pub struct AdmissionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
