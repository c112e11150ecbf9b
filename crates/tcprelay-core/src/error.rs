use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while setting up a relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Why a single pump stopped with an error.
///
/// These never leave the session that produced them; the engine records them
/// in the [`crate::engine::SessionReport`] for logging.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("destination accepted zero bytes")]
    WriteZero,

    #[error("flush failed: {0}")]
    Flush(#[source] io::Error),

    #[error("session idle for longer than {0:?}")]
    IdleTimeout(Duration),

    #[error("pump task failed: {0}")]
    Task(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
