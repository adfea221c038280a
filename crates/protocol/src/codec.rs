//! Binary framing for headers and responses.
//!
//! # Wire format
//!
//! ```text
//! FRAME:            [4 bytes BE: body_len][body_len bytes: body]
//!
//! HEADER BODY:
//!   [8 bytes BE: bundle_id]
//!   [4 bytes BE: len][auth_token UTF-8]
//!   [4 bytes BE: len][operation name]
//!   [4 bytes BE: len][format name, empty when absent]
//!   [4 bytes BE: len][location UTF-8]
//!   [4 bytes BE: len][message UTF-8]
//!
//! RESPONSE BODY:
//!   [4 bytes BE: status]
//!   [4 bytes BE: len][message UTF-8]
//!   [8 bytes BE: transferred_bytes]
//!   [8 bytes BE: persisted_bytes]
//!   [4 bytes BE: len][checksum UTF-8]
//! ```
//!
//! The `try_decode_*` functions distinguish a frame that has not fully
//! arrived (`Ok(None)`) from one that is complete but malformed (`Err`), so a
//! socket reader can keep accumulating bytes until a frame is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{FRAME_PREFIX_LEN, MAX_FRAME_SIZE};
use crate::error::ProtocolError;
use crate::header::Header;
use crate::response::Response;
use crate::types::{Operation, StorageFormat};

/// Encodes a header as a length-prefixed frame.
pub fn encode_header(header: &Header) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    body.put_u64(header.bundle_id);
    put_str(&mut body, &header.auth_token)?;
    put_str(&mut body, header.operation.as_str())?;
    put_str(&mut body, header.format.map(StorageFormat::as_str).unwrap_or(""))?;
    put_str(&mut body, &header.location)?;
    put_str(&mut body, &header.message)?;
    finish_frame(body)
}

/// Encodes a response as a length-prefixed frame.
pub fn encode_response(response: &Response) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    body.put_i32(response.status);
    put_str(&mut body, &response.message)?;
    body.put_u64(response.transferred_bytes);
    body.put_u64(response.persisted_bytes);
    put_str(&mut body, &response.checksum)?;
    finish_frame(body)
}

/// Attempts to decode a header frame from the start of `src`.
///
/// Returns the header and the number of bytes consumed, or `None` if `src`
/// does not yet hold a complete frame.
pub fn try_decode_header(src: &[u8]) -> Result<Option<(Header, usize)>, ProtocolError> {
    let Some((body, consumed)) = split_frame(src)? else {
        return Ok(None);
    };

    let mut fields = FieldReader::new(body);
    let bundle_id = fields.u64("bundle_id")?;
    let auth_token = fields.string("auth_token")?;
    let operation: Operation = fields.str("operation")?.parse()?;
    let format = StorageFormat::parse_optional(fields.str("format")?)?;
    let location = fields.string("location")?;
    let message = fields.string("message")?;
    fields.finish()?;

    let header = Header {
        bundle_id,
        auth_token,
        operation,
        format,
        location,
        message,
    };
    Ok(Some((header, consumed)))
}

/// Attempts to decode a response frame from the start of `src`.
pub fn try_decode_response(src: &[u8]) -> Result<Option<(Response, usize)>, ProtocolError> {
    let Some((body, consumed)) = split_frame(src)? else {
        return Ok(None);
    };

    let mut fields = FieldReader::new(body);
    let status = fields.i32("status")?;
    let message = fields.string("message")?;
    let transferred_bytes = fields.u64("transferred_bytes")?;
    let persisted_bytes = fields.u64("persisted_bytes")?;
    let checksum = fields.string("checksum")?;
    fields.finish()?;

    let response = Response {
        status,
        message,
        transferred_bytes,
        persisted_bytes,
        checksum,
    };
    Ok(Some((response, consumed)))
}

/// Returns the frame body and total frame length once the whole frame is
/// buffered.
fn split_frame(src: &[u8]) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    if src.len() < FRAME_PREFIX_LEN {
        return Ok(None);
    }
    let mut prefix = &src[..FRAME_PREFIX_LEN];
    let body_len = prefix.get_u32() as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    let frame_len = FRAME_PREFIX_LEN + body_len;
    if src.len() < frame_len {
        return Ok(None);
    }
    Ok(Some((&src[FRAME_PREFIX_LEN..frame_len], frame_len)))
}

fn put_str(dst: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: value.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    dst.put_u32(value.len() as u32);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn finish_frame(body: BytesMut) -> Result<Bytes, ProtocolError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = BytesMut::with_capacity(FRAME_PREFIX_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Sequential reader over the fields of a complete frame body.
struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        if self.buf.remaining() < 8 {
            return Err(ProtocolError::Truncated(field));
        }
        Ok(self.buf.get_u64())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        if self.buf.remaining() < 4 {
            return Err(ProtocolError::Truncated(field));
        }
        Ok(self.buf.get_i32())
    }

    fn str(&mut self, field: &'static str) -> Result<&'a str, ProtocolError> {
        if self.buf.remaining() < 4 {
            return Err(ProtocolError::Truncated(field));
        }
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated(field));
        }
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        std::str::from_utf8(value).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        self.str(field).map(str::to_owned)
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(self.buf.len()))
        }
    }
}

/// [`Decoder`]/[`Encoder`] for header frames, for use with `FramedRead`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderCodec;

impl Decoder for HeaderCodec {
    type Item = Header;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Header>, ProtocolError> {
        match try_decode_header(src)? {
            Some((header, consumed)) => {
                src.advance(consumed);
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<&Header> for HeaderCodec {
    type Error = ProtocolError;

    fn encode(&mut self, header: &Header, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&encode_header(header)?);
        Ok(())
    }
}

/// [`Decoder`]/[`Encoder`] for response frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        match try_decode_response(src)? {
            Some((response, consumed)) => {
                src.advance(consumed);
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<&Response> for ResponseCodec {
    type Error = ProtocolError;

    fn encode(&mut self, response: &Response, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&encode_response(response)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    fn sample_header() -> Header {
        Header::new(
            Operation::PersistData,
            Some(StorageFormat::DataDirectory),
            "/storage/vol1/2501",
        )
        .with_bundle_id(2_501_234_567_890)
        .with_auth_token("secret-token")
        .with_message("from client")
    }

    #[test]
    fn header_roundtrip_all_operations_and_formats() {
        let formats = StorageFormat::ALL
            .into_iter()
            .map(Some)
            .chain(std::iter::once(None));
        for format in formats {
            for op in Operation::ALL {
                let header = Header::new(op, format, "/data/bundle").with_bundle_id(7);
                let frame = encode_header(&header).unwrap();
                let (decoded, consumed) = try_decode_header(&frame).unwrap().unwrap();
                assert_eq!(decoded, header);
                assert_eq!(consumed, frame.len());
            }
        }
    }

    #[test]
    fn header_defaults_roundtrip() {
        let header = Header::ping();
        let frame = encode_header(&header).unwrap();
        // 8 (id) + 5 length prefixes + "PING".
        assert_eq!(frame.len(), FRAME_PREFIX_LEN + 8 + 5 * 4 + 4);
        let (decoded, _) = try_decode_header(&frame).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_prefix_is_incomplete_not_malformed() {
        let frame = encode_header(&sample_header()).unwrap();
        for cut in 0..frame.len() {
            let result = try_decode_header(&frame[..cut]).unwrap();
            assert!(result.is_none(), "prefix of {cut} bytes decoded");
        }
    }

    #[test]
    fn trailing_payload_is_not_consumed() {
        let mut buf = encode_header(&sample_header()).unwrap().to_vec();
        let frame_len = buf.len();
        buf.extend_from_slice(b"bundle bytes");
        let (header, consumed) = try_decode_header(&buf).unwrap().unwrap();
        assert_eq!(header, sample_header());
        assert_eq!(consumed, frame_len);
        assert_eq!(&buf[consumed..], b"bundle bytes");
    }

    #[test]
    fn unknown_operation_is_malformed() {
        let mut body = BytesMut::new();
        body.put_u64(1);
        put_str(&mut body, "").unwrap();
        put_str(&mut body, "DELETE_DATA").unwrap();
        put_str(&mut body, "").unwrap();
        put_str(&mut body, "").unwrap();
        put_str(&mut body, "").unwrap();
        let frame = finish_frame(body).unwrap();

        let err = try_decode_header(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOperation(_)));
    }

    #[test]
    fn unknown_format_is_malformed() {
        let mut body = BytesMut::new();
        body.put_u64(1);
        put_str(&mut body, "").unwrap();
        put_str(&mut body, "PERSIST_DATA").unwrap();
        put_str(&mut body, "ZARR").unwrap();
        put_str(&mut body, "").unwrap();
        put_str(&mut body, "").unwrap();
        let frame = finish_frame(body).unwrap();

        let err = try_decode_header(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFormat(_)));
    }

    #[test]
    fn field_overrunning_frame_is_malformed() {
        let mut body = BytesMut::new();
        body.put_u64(1);
        body.put_u32(100); // auth token claims 100 bytes but the frame ends.
        body.put_slice(b"abc");
        let frame = finish_frame(body).unwrap();

        let err = try_decode_header(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated("auth_token")));
    }

    #[test]
    fn trailing_bytes_inside_frame_are_malformed() {
        let header = encode_header(&Header::ping()).unwrap();
        let mut body = BytesMut::from(&header[FRAME_PREFIX_LEN..]);
        body.put_u8(0xFF);
        let frame = finish_frame(body).unwrap();

        let err = try_decode_header(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut body = BytesMut::new();
        body.put_u64(1);
        body.put_u32(2);
        body.put_slice(&[0xC3, 0x28]);
        let frame = finish_frame(body).unwrap();

        let err = try_decode_header(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8("auth_token")));
    }

    #[test]
    fn oversized_length_prefix_rejected_early() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        let err = try_decode_header(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn response_roundtrip() {
        let response = Response::ok(4608, 60, "ab12").with_message("stored");
        let frame = encode_response(&response).unwrap();
        let (decoded, consumed) = try_decode_response(&frame).unwrap().unwrap();
        assert_eq!(decoded, response);
        assert_eq!(consumed, frame.len());

        let error = Response::error("target already exists");
        let frame = encode_response(&error).unwrap();
        let (decoded, _) = try_decode_response(&frame).unwrap().unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn decoder_waits_for_more_bytes() {
        let frame = encode_header(&sample_header()).unwrap();
        let mut codec = HeaderCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&frame[10..]);
        let header = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(header, sample_header());
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_matches_free_function() {
        let mut codec = ResponseCodec;
        let response = Response::error("boom");
        let mut dst = BytesMut::new();
        codec.encode(&response, &mut dst).unwrap();
        assert_eq!(&dst[..], &encode_response(&response).unwrap()[..]);
    }

    #[tokio::test]
    async fn framed_read_decodes_split_stream() {
        let frame = encode_header(&sample_header()).unwrap();
        let (mut tx, rx) = tokio::io::duplex(8);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in frame.chunks(3) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let mut framed = FramedRead::new(rx, HeaderCodec);
        let header = framed.next().await.unwrap().unwrap();
        assert_eq!(header, sample_header());
        writer.await.unwrap();
    }
}
