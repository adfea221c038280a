//! Per-transfer state machine and the service that drives it.
//!
//! A transfer binds one request [`Header`](bundlestore_protocol::Header) to a
//! bundle strategy. The caller pumps bytes through an internal bounded pipe
//! while a background task runs the strategy on the blocking pool.

mod service;
mod state;

pub use service::DataTransferService;
pub use state::{State, TransferSnapshot, TransferState};

use bundlestore_protocol::Operation;

/// Default capacity of the internal pipe: 64 KiB.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Default number of transfers allowed to run bundle I/O at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 16;

/// Tuning for [`DataTransferService`].
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Background transfers beyond this wait for a free slot.
    pub max_concurrent_transfers: usize,
    /// Bytes buffered between the caller and the background task.
    pub pipe_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Outcome of one `write_data`/`read_data` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpResult {
    /// This many bytes moved through the pipe.
    Bytes(usize),
    /// The pipe is closed or failed before any byte moved.
    Closed,
}

impl PumpResult {
    /// Legacy count: the byte count, or `-1` when closed.
    pub fn as_count(self) -> i64 {
        match self {
            PumpResult::Bytes(n) => n as i64,
            PumpResult::Closed => -1,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, PumpResult::Closed)
    }
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(Operation),

    #[error("transfer already begun (state {0:?})")]
    AlreadyBegun(State),
}
