//! Pairing manager: turns an accepted upstream endpoint into a [`Session`].
//!
//! Exactly one downstream dial is attempted per upstream endpoint, bounded by
//! the dial timeout. On failure no session exists; the upstream endpoint is
//! handed back inside [`DialFailure`] so the caller closes it.

use crate::dialer::Dialer;
use crate::error::RelayError;
use crate::session::{Session, SessionId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time;
use tracing::debug;

/// A dial that did not produce a downstream endpoint.
pub struct DialFailure<U> {
    /// The upstream endpoint, still open. The caller must close it.
    pub upstream: U,
    pub error: RelayError,
}

impl<U> fmt::Debug for DialFailure<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialFailure")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Pairs upstream endpoints with fresh downstream connections to one fixed
/// target.
pub struct PairingManager<D> {
    dialer: D,
    target: String,
    dial_timeout: Duration,
    next_id: AtomicU64,
}

impl<D: Dialer> PairingManager<D> {
    pub fn new(dialer: D, target: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            target: target.into(),
            dial_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// The downstream address every session is paired with.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Dial the target once and associate the result with `upstream`.
    ///
    /// The returned session's cancellation signal starts lowered. Failures
    /// are not retried.
    pub async fn pair<U>(&self, upstream: U) -> Result<Session<U, D::Stream>, DialFailure<U>> {
        let dialed = time::timeout(self.dial_timeout, self.dialer.dial(&self.target)).await;

        let error = match dialed {
            Ok(Ok(downstream)) => {
                let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                debug!(session_id = %id, downstream = %self.target, "session paired");
                return Ok(Session::new(id, upstream, downstream));
            }
            Ok(Err(e)) => e,
            Err(_) => RelayError::DialTimeout {
                addr: self.target.clone(),
                timeout: self.dial_timeout,
            },
        };

        Err(DialFailure { upstream, error })
    }
}
