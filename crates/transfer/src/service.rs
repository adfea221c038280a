use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundlestore_bundle_io::{BundleError, BundleIoRegistry, path_size, remove_path};
use bundlestore_protocol::Operation;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::{State, StatusHandle, TransferState};
use crate::{PumpResult, TransferConfig, TransferError};

/// Binds transfers to bundle strategies and moves their bytes.
///
/// Cheap to clone; clones share the registry and the worker slots.
#[derive(Debug, Clone)]
pub struct DataTransferService {
    registry: Arc<BundleIoRegistry>,
    permits: Arc<Semaphore>,
    config: TransferConfig,
}

impl DataTransferService {
    /// Zero limits in `config` are raised to 1.
    pub fn new(registry: Arc<BundleIoRegistry>, config: TransferConfig) -> Self {
        let config = TransferConfig {
            max_concurrent_transfers: config.max_concurrent_transfers.max(1),
            pipe_capacity: config.pipe_capacity.max(1),
        };
        Self {
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrent_transfers)),
            config,
        }
    }

    pub fn registry(&self) -> &BundleIoRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Opens the transfer's pipe and starts its background task.
    ///
    /// A strategy lookup failure is recorded in the transfer as a terminal
    /// error state and is not returned. Operations other than persist and
    /// retrieve are rejected without touching the transfer.
    pub fn begin_transfer(&self, transfer: &mut TransferState) -> Result<(), TransferError> {
        let current = transfer.state();
        if current != State::Idle {
            return Err(TransferError::AlreadyBegun(current));
        }

        let header = transfer.header().clone();
        match header.operation {
            Operation::PersistData => self.begin_persist(transfer),
            Operation::RetrieveData => self.begin_retrieve(transfer),
            other => return Err(TransferError::UnsupportedOperation(other)),
        }

        info!(
            bundle_id = header.bundle_id,
            operation = %header.operation,
            location = %header.location,
            state = ?transfer.state(),
            "transfer begun"
        );
        Ok(())
    }

    fn begin_persist(&self, transfer: &mut TransferState) {
        let header = transfer.header();
        let bundle_id = header.bundle_id;
        let writer = match self.registry.writer(header.format) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(bundle_id, error = %e, "no writer for persist");
                transfer.status.fail(State::WriteError, e.to_string());
                return;
            }
        };
        let target = PathBuf::from(&header.location);

        let (caller_end, task_end) = tokio::io::duplex(self.config.pipe_capacity);
        transfer.writer = Some(caller_end);
        transfer.status.advance(State::WriteStarted);

        let status = transfer.status.clone();
        let permits = self.permits.clone();
        let abort = transfer.abort.clone();
        tokio::spawn(async move {
            let Some(_permit) = acquire(&permits, &status, State::WriteError).await else {
                return;
            };
            if abort.is_cancelled() {
                warn!(bundle_id, "persist aborted before it started");
                status.fail(State::WriteError, ABORTED);
                return;
            }
            status.advance(State::Write);

            let mut input = AbortOnCancel {
                inner: SyncIoBridge::new(task_end),
                abort,
            };
            let worker_status = status.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let preexisting = std::fs::symlink_metadata(&target).is_ok();
                let outcome = writer
                    .write_bundle(&mut input, &target)
                    .and_then(|info| Ok((path_size(&target)?, info)));
                match outcome {
                    Ok((persisted, info)) => {
                        info!(bundle_id, bytes = info.num_bytes, persisted, "bundle persisted");
                        worker_status.complete(
                            State::WriteComplete,
                            info.num_bytes,
                            persisted,
                            info.checksum,
                        );
                    }
                    Err(e) => {
                        error!(bundle_id, error = %e, target = %target.display(), "persist failed");
                        if !preexisting {
                            discard_partial(bundle_id, &target);
                        }
                        worker_status.fail(State::WriteError, e.to_string());
                    }
                }
                drop(input);
            })
            .await;

            if let Err(e) = joined {
                error!(bundle_id, error = %e, "persist worker aborted");
                status.fail(State::WriteError, format!("persist worker aborted: {e}"));
            }
        });
    }

    fn begin_retrieve(&self, transfer: &mut TransferState) {
        let header = transfer.header();
        let bundle_id = header.bundle_id;
        let reader = match self.registry.reader(header.format) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(bundle_id, error = %e, "no reader for retrieve");
                transfer.status.fail(State::ReadError, e.to_string());
                return;
            }
        };
        let source = PathBuf::from(&header.location);

        let (caller_end, task_end) = tokio::io::duplex(self.config.pipe_capacity);
        transfer.reader = Some(caller_end);
        transfer.status.advance(State::ReadStarted);

        let status = transfer.status.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Some(_permit) = acquire(&permits, &status, State::ReadError).await else {
                return;
            };
            status.advance(State::Read);

            let mut output = SyncIoBridge::new(task_end);
            let worker_status = status.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let outcome = reader.read_bundle(&source, &mut output).and_then(|info| {
                    std::io::Write::flush(&mut output)?;
                    Ok::<_, BundleError>(info)
                });
                // The terminal state is published before the pipe closes so a
                // caller that sees end-of-stream also sees the outcome.
                match outcome {
                    Ok(info) => {
                        info!(bundle_id, bytes = info.num_bytes, "bundle retrieved");
                        worker_status.complete(
                            State::ReadComplete,
                            info.num_bytes,
                            0,
                            info.checksum,
                        );
                    }
                    Err(e) => {
                        error!(
                            bundle_id,
                            error = %e,
                            source = %source.display(),
                            "retrieve failed"
                        );
                        worker_status.fail(State::ReadError, e.to_string());
                    }
                }
                if let Err(e) = output.shutdown() {
                    debug!(bundle_id, error = %e, "pipe shutdown after retrieve");
                }
                drop(output);
            })
            .await;

            if let Err(e) = joined {
                error!(bundle_id, error = %e, "retrieve worker aborted");
                status.fail(State::ReadError, format!("retrieve worker aborted: {e}"));
            }
        });
    }

    /// Writes all of `buf` into a persist transfer's pipe.
    ///
    /// Returns fewer bytes than `buf.len()` if the pipe fails part way, and
    /// [`PumpResult::Closed`] if nothing could be written.
    ///
    /// # Panics
    ///
    /// If `begin_transfer` was never called on `transfer`.
    pub async fn write_data(&self, buf: &[u8], transfer: &mut TransferState) -> PumpResult {
        transfer.assert_begun();
        let bundle_id = transfer.header().bundle_id;
        let Some(writer) = transfer.writer.as_mut() else {
            return PumpResult::Closed;
        };

        let mut written = 0;
        let mut failed = false;
        while written < buf.len() {
            match writer.write(&buf[written..]).await {
                Ok(0) => {
                    failed = true;
                    break;
                }
                Ok(n) => written += n,
                Err(e) => {
                    error!(bundle_id, error = %e, written, "transfer pipe write failed");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            transfer.writer = None;
            if written == 0 {
                return PumpResult::Closed;
            }
        }
        PumpResult::Bytes(written)
    }

    /// Fills `buf` from a retrieve transfer's pipe until it is full or the
    /// stream ends.
    ///
    /// Returns [`PumpResult::Closed`] once the stream is exhausted, and on
    /// every call after that.
    ///
    /// # Panics
    ///
    /// If `begin_transfer` was never called on `transfer`.
    pub async fn read_data(&self, buf: &mut [u8], transfer: &mut TransferState) -> PumpResult {
        transfer.assert_begun();
        let bundle_id = transfer.header().bundle_id;
        let Some(reader) = transfer.reader.as_mut() else {
            return PumpResult::Closed;
        };

        let mut filled = 0;
        let mut ended = false;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => {
                    ended = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    error!(bundle_id, error = %e, filled, "transfer pipe read failed");
                    ended = true;
                    break;
                }
            }
        }

        if ended && filled == 0 {
            transfer.reader = None;
            return PumpResult::Closed;
        }
        PumpResult::Bytes(filled)
    }

    /// Signals end-of-stream to a persist transfer's background task.
    ///
    /// Idempotent and safe before `begin_transfer`.
    pub async fn end_transfer(&self, transfer: &mut TransferState) {
        if let Some(mut writer) = transfer.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(bundle_id = transfer.header().bundle_id, error = %e, "pipe shutdown");
            }
            info!(bundle_id = transfer.header().bundle_id, "transfer input closed");
        }
    }

    /// Abandons a transfer whose stream was cut short.
    ///
    /// A persist in flight ends in [`State::WriteError`] and whatever it wrote
    /// is removed. A retrieve's background task fails at its next pipe write.
    /// Idempotent, and a no-op once `end_transfer` closed the input or a
    /// retrieve was read to the end.
    pub fn abort_transfer(&self, transfer: &mut TransferState) {
        let writer = transfer.writer.take();
        let reader = transfer.reader.take();
        if writer.is_none() && reader.is_none() {
            return;
        }
        transfer.abort.cancel();
        drop(writer);
        drop(reader);
        warn!(bundle_id = transfer.header().bundle_id, "transfer aborted");
    }
}

const ABORTED: &str = "transfer aborted";

/// Persist input that fails once its transfer is aborted, so a stream cut
/// short is never stored as a complete bundle.
struct AbortOnCancel<R> {
    inner: R,
    abort: CancellationToken,
}

impl<R: Read> Read for AbortOnCancel<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if self.abort.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, ABORTED));
        }
        Ok(n)
    }
}

/// Removes what a failed persist left at `target`.
fn discard_partial(bundle_id: u64, target: &Path) {
    if std::fs::symlink_metadata(target).is_err() {
        return;
    }
    match remove_path(target) {
        Ok(freed) => warn!(bundle_id, target = %target.display(), freed, "removed partial bundle"),
        Err(e) => error!(
            bundle_id,
            error = %e,
            target = %target.display(),
            "could not remove partial bundle"
        ),
    }
}

/// Waits for a worker slot; records `on_closed` if the service is gone.
async fn acquire(
    permits: &Arc<Semaphore>,
    status: &StatusHandle,
    on_closed: State,
) -> Option<tokio::sync::OwnedSemaphorePermit> {
    match permits.clone().acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(_) => {
            status.fail(on_closed, "transfer service is shutting down");
            None
        }
    }
}
