//! Outbound connection capability.
//!
//! The pairing manager does not open sockets itself; it asks a [`Dialer`] for
//! a stream to the configured target. [`TcpDialer`] is the production
//! implementation. Tests substitute in-memory dialers.

use crate::error::{RelayError, RelayResult};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{self, TcpStream};
use tracing::{debug, warn};

/// Something that can open a byte stream to an address.
pub trait Dialer: Send + Sync + 'static {
    /// The endpoint type produced by a successful dial.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open one stream to `target`. No retries, no pooling.
    fn dial<'a>(
        &'a self,
        target: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Self::Stream>> + Send + 'a>>;
}

/// Dials plain TCP connections.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    /// Set `TCP_NODELAY` on every dialed socket.
    pub nodelay: bool,
}

impl TcpDialer {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }

    async fn connect(&self, target: &str) -> RelayResult<TcpStream> {
        let addrs = resolve(target).await?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if self.nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(addr = %addr, error = %e, "could not set TCP_NODELAY");
                        }
                    }
                    debug!(downstream = %target, addr = %addr, "downstream connected");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        // resolve() never returns an empty list, so last_err is set here.
        let source = last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no addresses")
        });
        Err(RelayError::Dial {
            addr: target.to_string(),
            source,
        })
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial<'a>(
        &'a self,
        target: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<TcpStream>> + Send + 'a>> {
        Box::pin(self.connect(target))
    }
}

/// Resolve a `host:port` target to socket addresses via
/// `tokio::net::lookup_host`.
///
/// # Errors
///
/// Returns [`RelayError::Resolve`] if the lookup fails or yields nothing.
pub async fn resolve(target: &str) -> RelayResult<Vec<SocketAddr>> {
    match net::lookup_host(target).await {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                debug!(name = %target, "no addresses found");
                Err(RelayError::Resolve {
                    addr: target.to_string(),
                    reason: "no addresses found".to_string(),
                })
            } else {
                debug!(name = %target, count = addrs.len(), "resolved");
                Ok(addrs)
            }
        }
        Err(e) => {
            warn!(name = %target, error = %e, "resolution failed");
            Err(RelayError::Resolve {
                addr: target.to_string(),
                reason: e.to_string(),
            })
        }
    }
}
