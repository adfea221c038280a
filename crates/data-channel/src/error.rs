//! Error types for the data channel.

use bundlestore_bundle_io::BundleError;
use bundlestore_protocol::ProtocolError;
use bundlestore_transfer::TransferError;

/// Errors produced by the socket server and client.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("connection closed before {0}")]
    ConnectionClosed(&'static str),

    #[error("agent reported failure: {0}")]
    Rejected(String),

    #[error("local worker aborted: {0}")]
    WorkerAborted(#[from] tokio::task::JoinError),
}
