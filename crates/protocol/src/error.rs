//! Error types for the wire protocol.

/// Errors produced while encoding or decoding protocol frames.
///
/// An incomplete frame is not an error: the decoders return `Ok(None)` until
/// enough bytes have arrived.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown operation: {0:?}")]
    UnknownOperation(String),

    #[error("unknown storage format: {0:?}")]
    UnknownFormat(String),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("field `{0}` overruns the frame")]
    Truncated(&'static str),

    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),

    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
}
