//! TCP socket channel for bundle transfers.
//!
//! The agent runs a [`StorageServer`](server::StorageServer); clients use
//! [`StorageClient`](client::StorageClient). Each connection carries exactly
//! one request: a header frame, then the raw bundle bytes in the direction
//! of the transfer.
//!
//! # Wire format
//!
//! See [`wire`] module for the exchange sequence.

pub mod client;
pub mod error;
pub mod server;
pub mod wire;

pub use client::StorageClient;
pub use error::DataChannelError;
pub use server::{ServerConfig, StorageServer};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Port the agent listens on unless configured otherwise.
pub const DEFAULT_AGENT_PORT: u16 = 10_000;
