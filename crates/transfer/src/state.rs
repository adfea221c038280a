use std::sync::Arc;
use std::time::Instant;

use bundlestore_protocol::{Header, Response};
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle state of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    WriteStarted,
    Write,
    WriteComplete,
    WriteError,
    ReadStarted,
    Read,
    ReadComplete,
    ReadError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    None,
    Write,
    Read,
}

impl State {
    fn rank(self) -> u8 {
        match self {
            State::Idle => 0,
            State::WriteStarted | State::ReadStarted => 1,
            State::Write | State::Read => 2,
            State::WriteComplete | State::WriteError | State::ReadComplete | State::ReadError => 3,
        }
    }

    fn direction(self) -> Direction {
        match self {
            State::Idle => Direction::None,
            State::WriteStarted | State::Write | State::WriteComplete | State::WriteError => {
                Direction::Write
            }
            State::ReadStarted | State::Read | State::ReadComplete | State::ReadError => {
                Direction::Read
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub fn is_error(self) -> bool {
        matches!(self, State::WriteError | State::ReadError)
    }

    /// Whether `next` is a legal successor: strictly later and on the same
    /// side of the transfer.
    pub fn can_advance_to(self, next: State) -> bool {
        if next.rank() <= self.rank() {
            return false;
        }
        self.direction() == Direction::None || self.direction() == next.direction()
    }
}

/// Published view of a transfer: state plus outcome, updated atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub state: State,
    pub transferred_bytes: u64,
    pub persisted_bytes: u64,
    pub checksum: String,
    pub error: Option<String>,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
}

impl Default for TransferSnapshot {
    fn default() -> Self {
        Self {
            state: State::Idle,
            transferred_bytes: 0,
            persisted_bytes: 0,
            checksum: String::new(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

impl TransferSnapshot {
    /// The response to send for a terminal transfer; `None` before that.
    pub fn to_response(&self) -> Option<Response> {
        if !self.state.is_terminal() {
            return None;
        }
        if self.state.is_error() {
            let message = self.error.clone().unwrap_or_else(|| "transfer failed".into());
            return Some(Response::error(message));
        }
        Some(Response::ok(
            self.transferred_bytes,
            self.persisted_bytes,
            self.checksum.clone(),
        ))
    }
}

/// Shared publisher for a transfer's snapshot.
///
/// Held by the owning [`TransferState`] and by its background task.
#[derive(Debug, Clone)]
pub(crate) struct StatusHandle {
    bundle_id: u64,
    tx: Arc<watch::Sender<TransferSnapshot>>,
}

impl StatusHandle {
    fn new(bundle_id: u64) -> Self {
        let (tx, _rx) = watch::channel(TransferSnapshot::default());
        Self {
            bundle_id,
            tx: Arc::new(tx),
        }
    }

    pub(crate) fn current(&self) -> State {
        self.tx.borrow().state
    }

    /// Moves to a non-terminal state. Illegal transitions are ignored.
    pub(crate) fn advance(&self, next: State) -> bool {
        self.publish(next, |_| {})
    }

    /// Moves to a successful terminal state together with its outcome.
    pub(crate) fn complete(
        &self,
        next: State,
        transferred: u64,
        persisted: u64,
        checksum: String,
    ) -> bool {
        self.publish(next, |s| {
            s.transferred_bytes = transferred;
            s.persisted_bytes = persisted;
            s.checksum = checksum;
        })
    }

    /// Moves to an error terminal state together with its message.
    pub(crate) fn fail(&self, next: State, message: impl Into<String>) -> bool {
        let message = message.into();
        self.publish(next, |s| s.error = Some(message))
    }

    fn publish(&self, next: State, apply: impl FnOnce(&mut TransferSnapshot)) -> bool {
        let bundle_id = self.bundle_id;
        self.tx.send_if_modified(|snapshot| {
            let prev = snapshot.state;
            if !prev.can_advance_to(next) {
                warn!(bundle_id, ?prev, ?next, "ignoring illegal transfer state transition");
                return false;
            }
            let now = Instant::now();
            if prev == State::Idle {
                snapshot.started_at = Some(now);
            }
            if next.is_terminal() {
                snapshot.completed_at = Some(now);
            }
            apply(snapshot);
            snapshot.state = next;
            debug!(bundle_id, ?prev, ?next, "transfer state changed");
            true
        })
    }
}

/// One transfer, exclusively owned by the connection that created it.
///
/// Holds the originating header, the published lifecycle state and the
/// caller-side ends of the internal pipe. Dropping a persist transfer whose
/// input was never closed aborts it.
#[derive(Debug)]
pub struct TransferState {
    header: Header,
    pub(crate) status: StatusHandle,
    pub(crate) reader: Option<DuplexStream>,
    pub(crate) writer: Option<DuplexStream>,
    pub(crate) abort: CancellationToken,
}

impl TransferState {
    pub fn new(header: Header) -> Self {
        let status = StatusHandle::new(header.bundle_id);
        Self {
            header,
            status,
            reader: None,
            writer: None,
            abort: CancellationToken::new(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn state(&self) -> State {
        self.status.current()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.status.tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.status.tx.subscribe()
    }

    /// Waits until the transfer reaches a terminal state.
    ///
    /// Resolves immediately for a transfer that was never begun.
    pub async fn wait_for_completion(&self) -> TransferSnapshot {
        let mut rx = self.subscribe();
        match rx
            .wait_for(|s| s.state == State::Idle || s.state.is_terminal())
            .await
        {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// The response for this transfer, once terminal.
    pub fn response(&self) -> Option<Response> {
        self.snapshot().to_response()
    }

    pub(crate) fn assert_begun(&self) {
        assert!(
            self.state() != State::Idle,
            "data pumped on transfer {} before begin_transfer",
            self.header.bundle_id
        );
    }
}

impl Drop for TransferState {
    fn drop(&mut self) {
        // The abort must be visible before the pipe reports end-of-stream.
        if self.writer.is_some() {
            self.abort.cancel();
            self.writer = None;
        }
    }
}
