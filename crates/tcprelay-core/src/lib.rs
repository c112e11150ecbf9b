//! tcprelay-core: connection pairing and bidirectional relay engine.
//!
//! Every accepted upstream connection goes through the same pipeline:
//!
//! ```text
//! accepted upstream
//!   → PairingManager::pair        (one downstream dial, bounded by a timeout)
//!     → Session                   (upstream + downstream + shared signal)
//!       → RelayEngine::run        (two pumps, join, close both endpoints)
//!         → SessionReport
//! ```
//!
//! Endpoints are anything implementing tokio's `AsyncRead + AsyncWrite`, so
//! the engine runs unchanged over TCP sockets or in-memory pipes.

pub mod dialer;
pub mod engine;
pub mod error;
pub mod pairing;
pub mod pump;
pub mod session;

// Re-export commonly used items at crate root.
pub use dialer::{Dialer, TcpDialer};
pub use engine::{CloseOutcome, RelayEngine, SessionReport};
pub use error::{PumpError, RelayError, RelayResult};
pub use pairing::{DialFailure, PairingManager};
pub use pump::{Direction, PumpConfig, PumpReport, PumpState};
pub use session::{CancelHandle, Session, SessionId, SessionSignal};
