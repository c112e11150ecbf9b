//! Core server: accepts upstream connections and hands each one to the
//! pairing manager and relay engine.
//!
//! Per accepted connection, in its own task:
//!
//! ```text
//! accept → admission check → PairingManager::pair → RelayEngine::run → report
//!              │ rejected            │ dial failed
//!              └─ close upstream     └─ close upstream
//! ```
//!
//! A failure in one connection never affects another or the accept loop.

use crate::admission::AdmissionController;
use crate::config::RelayConfig;
use crate::tracker::SessionTracker;
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tcprelay_core::{DialFailure, PairingManager, RelayEngine, SessionReport, TcpDialer};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};

/// The tcprelay server instance.
pub struct RelayServer {
    config: RelayConfig,
    pairing: PairingManager<TcpDialer>,
    engine: RelayEngine,
    admission: AdmissionController,
    tracker: Arc<SessionTracker>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let pairing = PairingManager::new(
            TcpDialer::new(config.nodelay),
            config.target.clone(),
            config.dial_timeout,
        );
        let engine = RelayEngine::new(config.pump_config());
        let admission = AdmissionController::new(config.max_sessions);

        Self {
            config,
            pairing,
            engine,
            admission,
            tracker: Arc::new(SessionTracker::new()),
        }
    }

    /// Live-session registry, shared with the running server.
    #[cfg(test)]
    pub fn tracker(&self) -> Arc<SessionTracker> {
        self.tracker.clone()
    }

    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))
    }

    /// Accept connections until `shutdown` resolves, then cancel live
    /// sessions and wait up to the configured grace period for them.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        let local_addr = listener.local_addr().context("listener has no local address")?;

        info!(
            listen = %local_addr,
            downstream = %server.pairing.target(),
            max_sessions = server.config.max_sessions,
            "tcprelay ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, no longer accepting");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let srv = server.clone();
                            let slot = server.tracker.track_connection();
                            tokio::spawn(async move {
                                srv.handle_connection(stream, peer).await;
                                drop(slot);
                            });
                        }
                        Err(e) => {
                            // Transient (e.g. fd exhaustion); keep serving.
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
        drop(listener);

        let live = server.tracker.cancel_all().await;
        if live > 0 {
            info!(sessions = live, "cancelled live sessions, waiting for teardown");
        }
        // Connections still dialing register late and are cancelled then.
        if !server.tracker.wait_drained(server.config.shutdown_grace).await {
            let remaining = server.tracker.count().await;
            warn!(remaining, "grace period elapsed with sessions still live");
        }

        Ok(())
    }

    async fn handle_connection(&self, mut upstream: TcpStream, peer: SocketAddr) {
        let _slot = match self.admission.try_admit() {
            Ok(guard) => guard,
            Err(reason) => {
                warn!(peer = %peer, reason = %reason, "rejecting connection");
                close_upstream(&mut upstream, peer).await;
                return;
            }
        };

        if self.config.nodelay {
            if let Err(e) = upstream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
            }
        }

        let session = match self.pairing.pair(upstream).await {
            Ok(session) => session,
            Err(DialFailure {
                mut upstream,
                error,
            }) => {
                warn!(
                    peer = %peer,
                    downstream = %self.pairing.target(),
                    error = %error,
                    "downstream dial failed, closing upstream"
                );
                close_upstream(&mut upstream, peer).await;
                return;
            }
        };

        let id = session.id();
        let span = info_span!("session", id = %id, peer = %peer);
        async {
            info!(
                downstream = %self.pairing.target(),
                active = self.admission.active(),
                "session opened"
            );
            self.tracker.register(id, session.cancel_handle()).await;
            let report = self.engine.run(session).await;
            self.tracker.unregister(id).await;
            log_report(&report);
        }
        .instrument(span)
        .await;
    }
}

async fn close_upstream(upstream: &mut TcpStream, peer: SocketAddr) {
    if let Err(e) = upstream.shutdown().await {
        debug!(peer = %peer, error = %e, "upstream close failed");
    }
}

fn log_report(report: &SessionReport) {
    if report.is_clean() {
        info!(
            sent = report.outbound.bytes,
            received = report.inbound.bytes,
            "session closed"
        );
    } else {
        warn!(
            sent = report.outbound.bytes,
            received = report.inbound.bytes,
            outbound = ?report.outbound.state,
            inbound = ?report.inbound.state,
            upstream_close = ?report.upstream_close,
            downstream_close = ?report.downstream_close,
            "session closed with errors"
        );
    }
}
