//! Socket exchange for one request.
//!
//! # Exchange
//!
//! ```text
//! PING:          client -> [HEADER]
//!                agent  -> [RESPONSE "pong"]
//!
//! PERSIST_DATA:  client -> [HEADER][bundle bytes ...] (half-close)
//!                agent  -> [RESPONSE]
//!
//! RETRIEVE_DATA: client -> [HEADER] (half-close)
//!                agent  -> [RESPONSE][bundle bytes ...] (close)
//! ```
//!
//! Frame layouts are defined in [`bundlestore_protocol::codec`]. A retrieve's
//! response comes first: an error response ends the exchange with no bundle
//! bytes, an OK response is followed by the bundle up to end-of-stream. A
//! persist stream that fails before its half-close is discarded.

use bundlestore_protocol::{
    FRAME_PREFIX_LEN, Header, MAX_FRAME_SIZE, ProtocolError, Response, encode_header,
    encode_response, try_decode_response,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;

/// Writes a header frame and flushes.
pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &Header,
) -> Result<(), DataChannelError> {
    let frame = encode_header(header)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a response frame and flushes.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), DataChannelError> {
    let frame = encode_response(response)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one response frame.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Response, DataChannelError> {
    let body_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(DataChannelError::ConnectionClosed("response"));
        }
        Err(e) => return Err(e.into()),
    };
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: body_len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut frame = vec![0u8; FRAME_PREFIX_LEN + body_len];
    frame[..FRAME_PREFIX_LEN].copy_from_slice(&(body_len as u32).to_be_bytes());
    reader.read_exact(&mut frame[FRAME_PREFIX_LEN..]).await?;

    match try_decode_response(&frame)? {
        Some((response, _)) => Ok(response),
        None => Err(ProtocolError::Truncated("response").into()),
    }
}
