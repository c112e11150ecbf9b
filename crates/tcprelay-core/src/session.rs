//! Session: one upstream endpoint paired with one downstream endpoint.
//!
//! A [`Session`] is only ever built by the pairing manager after a successful
//! dial, so holding one means both legs exist. The downstream leg is bound at
//! construction and there is no API to replace it.
//!
//! The two pumps of a session share exactly one thing: a [`SessionSignal`].
//! It carries the monotonic cancellation flag, the count of pumps that have
//! reached a terminal state, and the last-activity timestamp used for the
//! optional idle timeout. Everything else (endpoints, buffers) is owned by a
//! single pump.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier assigned to a session when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct SignalState {
    cancelled: AtomicBool,
    finished: AtomicUsize,
    started_at: Instant,
    /// Milliseconds since `started_at` of the last successful read.
    last_activity_ms: AtomicU64,
}

/// Per-session state shared by the two pumps.
///
/// Cloning is cheap and every clone observes the same state. Nothing here is
/// shared across sessions.
#[derive(Debug, Clone)]
pub struct SessionSignal {
    state: Arc<SignalState>,
}

impl SessionSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                cancelled: AtomicBool::new(false),
                finished: AtomicUsize::new(0),
                started_at: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Raise the cancellation flag. Returns `true` only for the call that
    /// actually flipped it; the flag can never be lowered again.
    pub fn cancel(&self) -> bool {
        !self.state.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Record that one pump reached a terminal state and start teardown.
    ///
    /// Returns the number of pumps finished so far, including this one.
    pub(crate) fn finish(&self) -> usize {
        let finished = self.state.finished.fetch_add(1, Ordering::AcqRel) + 1;
        self.cancel();
        finished
    }

    /// Number of pumps that have reached a terminal state.
    pub fn finished(&self) -> usize {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Mark the session as active now.
    pub(crate) fn touch(&self) {
        let elapsed = self.state.started_at.elapsed().as_millis();
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        self.state
            .last_activity_ms
            .fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last successful read in either direction (or since the
    /// session started, if nothing was read yet).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.state.last_activity_ms.load(Ordering::Relaxed));
        self.state.started_at.elapsed().saturating_sub(last)
    }

    /// A handle that can only cancel, for holders outside the session.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: self.state.clone(),
        }
    }

    pub(crate) fn finish_guard(&self) -> FinishGuard {
        FinishGuard {
            signal: self.clone(),
        }
    }
}

/// External teardown trigger for a session.
///
/// Raising it has the same effect as a pump finishing: both pumps stop at
/// their next cancellation checkpoint and the engine closes both endpoints.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<SignalState>,
}

impl CancelHandle {
    pub fn cancel(&self) -> bool {
        !self.state.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

/// Marks a pump as finished when dropped, so a panicking pump still cancels
/// its sibling.
pub(crate) struct FinishGuard {
    signal: SessionSignal,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.signal.finish();
    }
}

/// An upstream endpoint paired with its downstream endpoint.
pub struct Session<U, D> {
    id: SessionId,
    upstream: U,
    downstream: D,
    signal: SessionSignal,
}

impl<U, D> Session<U, D> {
    pub(crate) fn new(id: SessionId, upstream: U, downstream: D) -> Self {
        Self {
            id,
            upstream,
            downstream,
            signal: SessionSignal::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn signal(&self) -> &SessionSignal {
        &self.signal
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.signal.cancel_handle()
    }

    pub(crate) fn into_parts(self) -> (SessionId, U, D, SessionSignal) {
        (self.id, self.upstream, self.downstream, self.signal)
    }
}

impl<U, D> fmt::Debug for Session<U, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cancelled", &self.signal.is_cancelled())
            .finish_non_exhaustive()
    }
}
