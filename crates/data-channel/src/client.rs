//! TCP storage client.
//!
//! Streams local bundles to an agent and back, using the same bundle
//! strategies the agent uses so both ends can compare byte counts and
//! checksums.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bundlestore_bundle_io::{BundleIoRegistry, TransferInfo};
use bundlestore_protocol::{Header, Operation, Response, StorageFormat};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

use crate::TCP_CONNECT_TIMEOUT;
use crate::error::DataChannelError;
use crate::wire::{read_response, write_header};

/// Client for one agent's storage server.
#[derive(Debug, Clone)]
pub struct StorageClient {
    addr: SocketAddr,
    registry: Arc<BundleIoRegistry>,
    auth_token: String,
    connect_timeout: Duration,
}

impl StorageClient {
    pub fn new(addr: SocketAddr, registry: Arc<BundleIoRegistry>) -> Self {
        Self {
            addr,
            registry,
            auth_token: String::new(),
            connect_timeout: TCP_CONNECT_TIMEOUT,
        }
    }

    /// Token placed in every request header.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> Result<TcpStream, DataChannelError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => {
                debug!(addr = %self.addr, "connected to storage agent");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "could not disable Nagle's algorithm");
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DataChannelError::Timeout),
        }
    }

    fn header(
        &self,
        operation: Operation,
        format: Option<StorageFormat>,
        location: &str,
    ) -> Header {
        Header::new(operation, format, location).with_auth_token(self.auth_token.clone())
    }

    /// Checks that the agent answers; returns its response.
    pub async fn ping(&self) -> Result<Response, DataChannelError> {
        let mut stream = self.connect().await?;
        write_header(&mut stream, &self.header(Operation::Ping, None, "")).await?;
        let response = read_response(&mut stream).await?;
        if !response.is_ok() {
            return Err(DataChannelError::Rejected(response.message));
        }
        Ok(response)
    }

    /// Streams the local bundle at `source` to `remote_target` on the agent.
    ///
    /// Returns what was sent together with the agent's response; an error
    /// response is returned as-is so callers can inspect its message.
    pub async fn persist_bundle(
        &self,
        bundle_id: u64,
        format: StorageFormat,
        source: &Path,
        remote_target: &str,
    ) -> Result<(TransferInfo, Response), DataChannelError> {
        let reader = self.registry.reader(Some(format))?;
        let stream = self.connect().await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let header = self
            .header(Operation::PersistData, Some(format), remote_target)
            .with_bundle_id(bundle_id);
        write_header(&mut write_half, &header).await?;

        let mut sink = SyncIoBridge::new(write_half);
        let source = PathBuf::from(source);
        let sent = tokio::task::spawn_blocking(move || {
            let info = reader.read_bundle(&source, &mut sink)?;
            sink.flush()?;
            sink.shutdown()?;
            Ok::<_, DataChannelError>(info)
        })
        .await??;

        let response = read_response(&mut read_half).await?;
        info!(
            bundle_id,
            sent = sent.num_bytes,
            received = response.transferred_bytes,
            ok = response.is_ok(),
            "bundle persisted on agent"
        );
        Ok((sent, response))
    }

    /// Streams `remote_source` from the agent into a new local bundle at
    /// `target`.
    ///
    /// Fails with [`DataChannelError::Rejected`] when the agent cannot read
    /// the source, in which case nothing is created at `target`.
    pub async fn retrieve_bundle(
        &self,
        bundle_id: u64,
        format: StorageFormat,
        remote_source: &str,
        target: &Path,
    ) -> Result<TransferInfo, DataChannelError> {
        let writer = self.registry.writer(Some(format))?;
        let stream = self.connect().await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let header = self
            .header(Operation::RetrieveData, Some(format), remote_source)
            .with_bundle_id(bundle_id);
        write_header(&mut write_half, &header).await?;
        write_half.shutdown().await?;

        let response = read_response(&mut read_half).await?;
        if !response.is_ok() {
            debug!(bundle_id, message = %response.message, "retrieve rejected by agent");
            return Err(DataChannelError::Rejected(response.message));
        }

        let mut input = SyncIoBridge::new(read_half);
        let target = PathBuf::from(target);
        let received = tokio::task::spawn_blocking(move || {
            writer
                .write_bundle(&mut input, &target)
                .map_err(DataChannelError::from)
        })
        .await??;

        info!(bundle_id, bytes = received.num_bytes, "bundle retrieved from agent");
        Ok(received)
    }
}
