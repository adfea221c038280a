//! TCP storage server (agent side).
//!
//! Accepts connections until cancelled and serves one request per
//! connection through the [`DataTransferService`].

use std::net::{Ipv4Addr, SocketAddr};

use bundlestore_protocol::{Header, HeaderCodec, Operation, Response};
use bundlestore_transfer::{DataTransferService, PumpResult, TransferState};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::wire::write_response;
use crate::{DEFAULT_AGENT_PORT, TCP_BUFFER_SIZE};

/// Listener settings for [`StorageServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_AGENT_PORT)),
        }
    }
}

/// Socket front end of the agent's transfer service.
pub struct StorageServer {
    service: DataTransferService,
    cancel: CancellationToken,
}

impl StorageServer {
    pub fn new(service: DataTransferService, cancel: CancellationToken) -> Self {
        Self { service, cancel }
    }

    /// Binds the listener described by `config`.
    pub async fn bind(&self, config: &ServerConfig) -> Result<TcpListener, DataChannelError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "storage server listening");
        Ok(listener)
    }

    /// Accepts connections until the server's token is cancelled.
    ///
    /// Each connection is handled on its own task; a failing connection is
    /// logged and does not stop the accept loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DataChannelError> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("storage server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer, "connection accepted");
            let service = self.service.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(service, stream, cancel).await {
                    warn!(%peer, error = %e, "connection failed");
                }
            });
        }
    }
}

async fn handle_connection(
    service: DataTransferService,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), DataChannelError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable Nagle's algorithm");
    }
    let (reader, mut writer) = stream.into_split();

    let mut frames = FramedRead::with_capacity(reader, HeaderCodec, TCP_BUFFER_SIZE);
    let header = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DataChannelError::Cancelled),
        next = frames.next() => match next {
            Some(Ok(header)) => header,
            Some(Err(e)) => {
                let reply = write_response(&mut writer, &Response::error(e.to_string())).await;
                if let Err(reply_error) = reply {
                    debug!(error = %reply_error, "could not report malformed header");
                }
                return Err(e.into());
            }
            None => return Err(DataChannelError::ConnectionClosed("header")),
        },
    };
    // Bytes that arrived with the header frame belong to the payload.
    let leftover = frames.read_buffer().to_vec();
    let reader = frames.into_inner();

    info!(
        bundle_id = header.bundle_id,
        operation = %header.operation,
        location = %header.location,
        "request received"
    );

    match header.operation {
        Operation::Ping => {
            write_response(&mut writer, &Response::ok(0, 0, "").with_message("pong")).await?;
        }
        Operation::PersistData => {
            serve_persist(&service, header, leftover, reader, &mut writer, &cancel).await?;
        }
        Operation::RetrieveData => {
            serve_retrieve(&service, header, &mut writer, &cancel).await?;
        }
        other => {
            let message = format!("unsupported operation: {other}");
            write_response(&mut writer, &Response::error(message)).await?;
        }
    }

    writer.shutdown().await?;
    Ok(())
}

async fn serve_persist(
    service: &DataTransferService,
    header: Header,
    leftover: Vec<u8>,
    mut reader: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    cancel: &CancellationToken,
) -> Result<(), DataChannelError> {
    let mut transfer = TransferState::new(header);
    service.begin_transfer(&mut transfer)?;

    let mut accepting = true;
    if !leftover.is_empty() {
        accepting = !service.write_data(&leftover, &mut transfer).await.is_closed();
    }

    let mut buf = vec![0u8; TCP_BUFFER_SIZE];
    let mut received = leftover.len() as u64;
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                service.abort_transfer(&mut transfer);
                return Err(DataChannelError::Cancelled);
            }
            n = reader.read(&mut buf) => match n {
                Ok(n) => n,
                Err(e) => {
                    // A reset stream is incomplete; never commit it.
                    service.abort_transfer(&mut transfer);
                    return Err(e.into());
                }
            },
        };
        if n == 0 {
            break;
        }
        received += n as u64;
        // Once the transfer stops accepting, keep draining so the client can
        // finish sending and read the response.
        if accepting && service.write_data(&buf[..n], &mut transfer).await.is_closed() {
            accepting = false;
        }
    }

    service.end_transfer(&mut transfer).await;
    let snapshot = transfer.wait_for_completion().await;
    debug!(
        bundle_id = transfer.header().bundle_id,
        received,
        state = ?snapshot.state,
        "persist finished"
    );

    let response = snapshot
        .to_response()
        .unwrap_or_else(|| Response::error("transfer did not complete"));
    write_response(writer, &response).await
}

/// Answers with a response frame before any bundle bytes: an error when the
/// source cannot be read at all, otherwise OK followed by the stream.
async fn serve_retrieve(
    service: &DataTransferService,
    header: Header,
    writer: &mut OwnedWriteHalf,
    cancel: &CancellationToken,
) -> Result<(), DataChannelError> {
    let mut transfer = TransferState::new(header);
    service.begin_transfer(&mut transfer)?;

    let mut buf = vec![0u8; TCP_BUFFER_SIZE];
    let mut pumped = pump_retrieve(service, &mut buf, &mut transfer, cancel).await?;
    if pumped.is_closed() {
        let snapshot = transfer.wait_for_completion().await;
        if snapshot.state.is_error() {
            debug!(
                bundle_id = transfer.header().bundle_id,
                error = ?snapshot.error,
                "retrieve rejected"
            );
            let response = snapshot
                .to_response()
                .unwrap_or_else(|| Response::error("transfer did not complete"));
            return write_response(writer, &response).await;
        }
    }

    write_response(writer, &Response::ok(0, 0, "")).await?;
    while let PumpResult::Bytes(n) = pumped {
        writer.write_all(&buf[..n]).await?;
        pumped = pump_retrieve(service, &mut buf, &mut transfer, cancel).await?;
    }
    writer.flush().await?;

    let snapshot = transfer.wait_for_completion().await;
    debug!(
        bundle_id = transfer.header().bundle_id,
        bytes = snapshot.transferred_bytes,
        state = ?snapshot.state,
        "retrieve finished"
    );
    match snapshot.error {
        // Already answered OK, so the failure only reaches the log.
        Some(message) if snapshot.state.is_error() => Err(DataChannelError::Rejected(message)),
        _ => Ok(()),
    }
}

async fn pump_retrieve(
    service: &DataTransferService,
    buf: &mut [u8],
    transfer: &mut TransferState,
    cancel: &CancellationToken,
) -> Result<PumpResult, DataChannelError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            service.abort_transfer(transfer);
            Err(DataChannelError::Cancelled)
        }
        pumped = service.read_data(buf, transfer) => Ok(pumped),
    }
}
