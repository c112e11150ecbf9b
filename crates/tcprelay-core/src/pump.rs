//! One-directional pump: source endpoint → destination endpoint.
//!
//! A pump loops over `check cancel → read → write everything → flush` with a
//! single transfer buffer it owns exclusively. The buffer is only refilled
//! after the previous chunk has been fully written and flushed.
//!
//! Cancellation is cooperative. The flag is checked once at the top of each
//! iteration; it does not interrupt a read or write in progress. Every read
//! and every backpressured write waits at most one `poll_interval`, so an idle
//! pump comes back to its checkpoint at least that often. An elapsed read wait
//! counts as a zero-byte read and is not terminal.
//!
//! ```text
//! RUNNING ─┬─ source EOF ────────────────► STOPPED_CLEAN
//!          ├─ read/write/flush failure ──► STOPPED_ERROR
//!          └─ cancellation observed ─────► STOPPED_CANCELLED
//! ```

use crate::error::PumpError;
use crate::session::SessionSignal;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::{debug, warn};

/// Default transfer buffer size (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default poll interval for reads and backpressured writes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which way a pump moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    UpstreamToDownstream,
    DownstreamToUpstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::UpstreamToDownstream => f.write_str("upstream->downstream"),
            Direction::DownstreamToUpstream => f.write_str("downstream->upstream"),
        }
    }
}

/// Lifecycle of a pump. Every state except `Running` is terminal.
#[derive(Debug)]
pub enum PumpState {
    Running,
    /// The source reached end-of-stream.
    StoppedClean,
    StoppedError(PumpError),
    StoppedCancelled,
}

impl PumpState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PumpState::Running)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PumpState::StoppedError(_))
    }
}

/// Tuning shared by both pumps of every session.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Size of each pump's transfer buffer.
    pub buffer_size: usize,
    /// Upper bound on a single read or write wait before the pump revisits
    /// its cancellation checkpoint.
    pub poll_interval: Duration,
    /// Stop the session after this long without a successful read in either
    /// direction. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: None,
        }
    }
}

/// What a pump did before it stopped.
#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    pub state: PumpState,
    /// Bytes confirmed written to the destination.
    pub bytes: u64,
}

enum Stop {
    Cancelled,
    Failed(PumpError),
}

pub(crate) struct Pump<R, W> {
    direction: Direction,
    source: R,
    destination: W,
    signal: SessionSignal,
    config: PumpConfig,
    bytes: u64,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(
        direction: Direction,
        source: R,
        destination: W,
        signal: SessionSignal,
        config: PumpConfig,
    ) -> Self {
        Self {
            direction,
            source,
            destination,
            signal,
            config,
            bytes: 0,
        }
    }

    /// Run until a terminal state, then hand the endpoint halves back so the
    /// engine can close them.
    pub(crate) async fn run(mut self) -> (R, W, PumpReport) {
        // Reaching a terminal state starts session teardown, even on panic.
        let _finish = self.signal.finish_guard();

        let state = self.pump().await;
        match &state {
            PumpState::StoppedError(e) => {
                warn!(direction = %self.direction, bytes = self.bytes, error = %e, "pump stopped on error");
            }
            other => {
                debug!(direction = %self.direction, bytes = self.bytes, state = ?other, "pump stopped");
            }
        }

        let report = PumpReport {
            direction: self.direction,
            state,
            bytes: self.bytes,
        };
        (self.source, self.destination, report)
    }

    async fn pump(&mut self) -> PumpState {
        let mut buf = vec![0u8; self.config.buffer_size.max(1)];

        let mut state = PumpState::Running;
        while !state.is_terminal() {
            state = self.step(&mut buf).await;
        }
        state
    }

    /// One iteration: checkpoint, read, deliver. `Running` means go again.
    async fn step(&mut self, buf: &mut [u8]) -> PumpState {
        if self.signal.is_cancelled() {
            return PumpState::StoppedCancelled;
        }

        let n = match time::timeout(self.config.poll_interval, self.source.read(buf)).await {
            Err(_elapsed) => {
                if let Some(limit) = self.config.idle_timeout {
                    if self.signal.idle_for() >= limit {
                        return PumpState::StoppedError(PumpError::IdleTimeout(limit));
                    }
                }
                return PumpState::Running;
            }
            Ok(Ok(0)) => return PumpState::StoppedClean,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return PumpState::StoppedError(PumpError::Read(e)),
        };
        self.signal.touch();

        // `buf` is not touched again until this chunk is fully handed off.
        match self.deliver(&buf[..n]).await {
            Ok(()) => PumpState::Running,
            Err(Stop::Cancelled) => PumpState::StoppedCancelled,
            Err(Stop::Failed(e)) => PumpState::StoppedError(e),
        }
    }

    /// Write all of `data`, draining partial writes, then flush.
    ///
    /// Backpressure is waited out indefinitely while the session is live. Once
    /// cancelled, a wait that makes no progress for a whole poll interval
    /// abandons the chunk: the destination is about to be closed anyway.
    async fn deliver(&mut self, mut data: &[u8]) -> Result<(), Stop> {
        let poll = self.config.poll_interval;

        while !data.is_empty() {
            match time::timeout(poll, self.destination.write(data)).await {
                Err(_elapsed) => {
                    if self.signal.is_cancelled() {
                        debug!(direction = %self.direction, pending = data.len(), "abandoning stalled write");
                        return Err(Stop::Cancelled);
                    }
                }
                Ok(Ok(0)) => return Err(Stop::Failed(PumpError::WriteZero)),
                Ok(Ok(written)) => {
                    data = &data[written..];
                    self.bytes += written as u64;
                }
                Ok(Err(e)) => return Err(Stop::Failed(PumpError::Write(e))),
            }
        }

        loop {
            match time::timeout(poll, self.destination.flush()).await {
                Err(_elapsed) => {
                    if self.signal.is_cancelled() {
                        return Err(Stop::Cancelled);
                    }
                }
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => return Err(Stop::Failed(PumpError::Flush(e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::DuplexStream;

    fn test_config() -> PumpConfig {
        PumpConfig {
            buffer_size: 64,
            poll_interval: Duration::from_millis(20),
            idle_timeout: None,
        }
    }

    /// Accepts at most `limit` bytes per write call.
    struct Trickle {
        inner: Vec<u8>,
        limit: usize,
        calls: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.inner.extend_from_slice(&buf[..n]);
            self.calls += 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails every write.
    struct Broken;

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn pump<W: AsyncWrite + Unpin>(
        source: DuplexStream,
        destination: W,
        signal: &SessionSignal,
    ) -> Pump<DuplexStream, W> {
        Pump::new(
            Direction::UpstreamToDownstream,
            source,
            destination,
            signal.clone(),
            test_config(),
        )
    }

    #[tokio::test]
    async fn drains_partial_writes() {
        let (mut writer, source) = tokio::io::duplex(1024);
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        writer.write_all(&payload).await.unwrap();
        drop(writer);

        let signal = SessionSignal::new();
        let sink = Trickle {
            inner: Vec::new(),
            limit: 3,
            calls: 0,
        };
        let (_, sink, report) = pump(source, sink, &signal).run().await;

        assert!(matches!(report.state, PumpState::StoppedClean));
        assert_eq!(report.bytes, 500);
        assert_eq!(sink.inner, payload);
        assert!(sink.calls >= 500 / 3);
    }

    #[tokio::test]
    async fn quiet_source_is_not_terminal() {
        let (mut writer, source) = tokio::io::duplex(64);
        let signal = SessionSignal::new();
        let sink = Trickle {
            inner: Vec::new(),
            limit: usize::MAX,
            calls: 0,
        };
        let handle = tokio::spawn(pump(source, sink, &signal).run());

        // Several poll intervals pass with nothing to read.
        time::sleep(Duration::from_millis(100)).await;
        writer.write_all(b"late").await.unwrap();
        drop(writer);

        let (_, sink, report) = handle.await.unwrap();
        assert!(matches!(report.state, PumpState::StoppedClean));
        assert_eq!(sink.inner, b"late");
    }

    #[tokio::test]
    async fn observes_cancellation_while_idle() {
        let (_writer, source) = tokio::io::duplex(64);
        let signal = SessionSignal::new();
        let sink = Trickle {
            inner: Vec::new(),
            limit: usize::MAX,
            calls: 0,
        };
        let handle = tokio::spawn(pump(source, sink, &signal).run());

        signal.cancel();
        let (_, _, report) = time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump should stop within a few poll intervals")
            .unwrap();
        assert!(matches!(report.state, PumpState::StoppedCancelled));
        assert_eq!(signal.finished(), 1);
    }

    #[tokio::test]
    async fn write_failure_stops_pump() {
        let (mut writer, source) = tokio::io::duplex(64);
        writer.write_all(b"doomed").await.unwrap();

        let signal = SessionSignal::new();
        let (_, _, report) = pump(source, Broken, &signal).run().await;
        assert!(matches!(
            report.state,
            PumpState::StoppedError(PumpError::Write(_))
        ));
        assert_eq!(report.bytes, 0);
        // A terminal pump always starts teardown.
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn stalled_write_abandoned_after_cancel() {
        let (mut writer, source) = tokio::io::duplex(64);
        // Destination pipe with a tiny buffer and nobody reading it.
        let (destination, _unread) = tokio::io::duplex(8);
        writer.write_all(&[7u8; 32]).await.unwrap();

        let signal = SessionSignal::new();
        let handle = tokio::spawn(pump(source, destination, &signal).run());

        time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished(), "backpressure alone must not stop the pump");

        signal.cancel();
        let (_, _, report) = time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.state, PumpState::StoppedCancelled));
        assert_eq!(report.bytes, 8);
    }

    #[tokio::test]
    async fn idle_timeout_stops_pump() {
        let (_writer, source) = tokio::io::duplex(64);
        let signal = SessionSignal::new();
        let config = PumpConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..test_config()
        };
        let sink = Trickle {
            inner: Vec::new(),
            limit: usize::MAX,
            calls: 0,
        };
        let run = Pump::new(
            Direction::DownstreamToUpstream,
            source,
            sink,
            signal.clone(),
            config,
        )
        .run();
        let (_, _, report) = time::timeout(Duration::from_secs(1), run).await.unwrap();
        assert!(matches!(
            report.state,
            PumpState::StoppedError(PumpError::IdleTimeout(_))
        ));
        assert_eq!(report.direction, Direction::DownstreamToUpstream);
    }

    #[test]
    fn terminal_states() {
        assert!(!PumpState::Running.is_terminal());
        assert!(PumpState::StoppedClean.is_terminal());
        assert!(PumpState::StoppedCancelled.is_terminal());
        assert!(PumpState::StoppedError(PumpError::WriteZero).is_error());
    }
}
