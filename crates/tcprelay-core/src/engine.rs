//! Relay engine: runs a session's two pumps and tears the session down.
//!
//! Each endpoint is split into a read half and a write half. The
//! upstream→downstream pump owns the upstream read half and the downstream
//! write half; the other pump owns the remaining two. Both run as separate
//! tokio tasks.
//!
//! Teardown order:
//!
//! 1. The first pump to reach a terminal state raises the session's
//!    cancellation flag.
//! 2. The engine joins both pump tasks. Nothing is closed before both pumps
//!    have stopped.
//! 3. Each endpoint is reassembled from its halves and closed exactly once.
//!    A failed close is reported and does not prevent closing the other one.

use crate::error::PumpError;
use crate::pump::{Direction, Pump, PumpConfig, PumpReport, PumpState};
use crate::session::{Session, SessionId};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinError;
use tokio::time;
use tracing::{debug, warn, Instrument, Span};

/// How closing one endpoint went.
#[derive(Debug)]
pub enum CloseOutcome {
    Closed,
    /// The peer was already gone; closing again was a no-op.
    AlreadyClosed,
    Failed(io::Error),
    /// A pump task failed and took its half of the endpoint with it. The
    /// endpoint was released when that half was dropped.
    Dropped,
}

impl CloseOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseOutcome::Failed(_))
    }
}

/// Everything that happened to a session, produced once it is fully torn
/// down.
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    /// The upstream→downstream pump.
    pub outbound: PumpReport,
    /// The downstream→upstream pump.
    pub inbound: PumpReport,
    pub upstream_close: CloseOutcome,
    pub downstream_close: CloseOutcome,
}

impl SessionReport {
    /// No pump error and no close failure.
    pub fn is_clean(&self) -> bool {
        !self.outbound.state.is_error()
            && !self.inbound.state.is_error()
            && !self.upstream_close.is_failure()
            && !self.downstream_close.is_failure()
    }
}

/// Runs sessions. One engine is shared by every session of a relay.
#[derive(Debug, Clone, Default)]
pub struct RelayEngine {
    config: PumpConfig,
}

impl RelayEngine {
    pub fn new(config: PumpConfig) -> Self {
        Self { config }
    }

    /// Relay `session` until both pumps stop, then close both endpoints.
    ///
    /// Returns only after teardown has completed. Pump tasks inherit the
    /// caller's tracing span.
    pub async fn run<U, D>(&self, session: Session<U, D>) -> SessionReport
    where
        U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (id, upstream, downstream, signal) = session.into_parts();
        let (upstream_read, upstream_write) = tokio::io::split(upstream);
        let (downstream_read, downstream_write) = tokio::io::split(downstream);

        let outbound = Pump::new(
            Direction::UpstreamToDownstream,
            upstream_read,
            downstream_write,
            signal.clone(),
            self.config,
        );
        let inbound = Pump::new(
            Direction::DownstreamToUpstream,
            downstream_read,
            upstream_write,
            signal.clone(),
            self.config,
        );

        let outbound = tokio::spawn(outbound.run().instrument(Span::current()));
        let inbound = tokio::spawn(inbound.run().instrument(Span::current()));

        // Join barrier: both pumps are terminal past this point.
        let (outbound, inbound) = tokio::join!(outbound, inbound);
        debug_assert_eq!(signal.finished(), 2);

        let (upstream_read, downstream_write, outbound) =
            unpack(outbound, Direction::UpstreamToDownstream);
        let (downstream_read, upstream_write, inbound) =
            unpack(inbound, Direction::DownstreamToUpstream);

        let upstream_close = self.close("upstream", upstream_read, upstream_write).await;
        let downstream_close = self
            .close("downstream", downstream_read, downstream_write)
            .await;

        debug!(
            session_id = %id,
            sent = outbound.bytes,
            received = inbound.bytes,
            "session torn down"
        );

        SessionReport {
            id,
            outbound,
            inbound,
            upstream_close,
            downstream_close,
        }
    }

    /// Reassemble and close one endpoint. Called exactly once per endpoint.
    async fn close<S>(
        &self,
        side: &'static str,
        read: Option<ReadHalf<S>>,
        write: Option<WriteHalf<S>>,
    ) -> CloseOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (Some(read), Some(write)) = (read, write) else {
            debug!(side, "endpoint released by failed pump task");
            return CloseOutcome::Dropped;
        };

        let mut stream = read.unsplit(write);
        let outcome = match time::timeout(self.config.poll_interval, stream.shutdown()).await {
            Ok(Ok(())) => CloseOutcome::Closed,
            Ok(Err(e)) if is_disconnect(&e) => {
                debug!(side, error = %e, "endpoint already closed");
                CloseOutcome::AlreadyClosed
            }
            Ok(Err(e)) => {
                warn!(side, error = %e, "close failed");
                CloseOutcome::Failed(e)
            }
            Err(_elapsed) => {
                warn!(side, "close timed out");
                CloseOutcome::Failed(io::ErrorKind::TimedOut.into())
            }
        };
        drop(stream);
        outcome
    }
}

type PumpOutput<R, W> = (Option<R>, Option<W>, PumpReport);

fn unpack<R, W>(
    joined: Result<(R, W, PumpReport), JoinError>,
    direction: Direction,
) -> PumpOutput<R, W> {
    match joined {
        Ok((read, write, report)) => (Some(read), Some(write), report),
        Err(e) => {
            warn!(direction = %direction, error = %e, "pump task failed");
            let report = PumpReport {
                direction,
                state: PumpState::StoppedError(PumpError::Task(e.to_string())),
                bytes: 0,
            };
            (None, None, report)
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
