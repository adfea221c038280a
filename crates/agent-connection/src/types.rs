//! Public types for connection checking.

use std::fmt;
use std::time::Duration;

/// Circuit status of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// Peer unreachable; the circuit is tripped.
    Open,
    /// Peer reachable.
    #[default]
    Closed,
    /// Recent probes failed but the trip threshold has not been reached.
    HalfClosed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Open => "OPEN",
            ConnectionStatus::Closed => "CLOSED",
            ConnectionStatus::HalfClosed => "HALF_CLOSED",
        })
    }
}

/// Liveness record for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed probes since the last success.
    pub attempts: u32,
}

impl ConnectionState {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            attempts: 0,
        }
    }
}

/// A change in circuit status worth notifying about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A success after the circuit was not closed.
    Recovered,
    /// Failures reached the trip threshold.
    Tripped,
}

/// Schedule and threshold for a [`PeriodicConnectionChecker`](crate::PeriodicConnectionChecker).
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Delay before the first probe; zero probes immediately.
    pub initial_delay: Duration,
    /// Interval between probes.
    pub period: Duration,
    /// Consecutive failures that trip the circuit.
    pub trip_threshold: u32,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            period: Duration::from_secs(30),
            trip_threshold: 3,
        }
    }
}
