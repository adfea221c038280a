//! Connection resilience for agents.
//!
//! An agent keeps its registration with the master alive by probing it on a
//! fixed schedule. Probe outcomes feed a [`CircuitBreaker`]; the
//! [`PeriodicConnectionChecker`] fires a callback only when the circuit
//! changes between usable and tripped.

mod breaker;
mod checker;
mod probe;
mod types;

pub use breaker::CircuitBreaker;
pub use checker::{Callback, PeriodicConnectionChecker};
pub use probe::{ConnectionTester, ProbeFuture, TcpProbe};
pub use types::{CheckerConfig, ConnectionState, ConnectionStatus, Transition};

/// Errors a connection probe can report.
///
/// Any of these counts as a failed probe; none reaches the checker's caller.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("probe panicked: {0}")]
    Panicked(String),
}
