//! Wire protocol for bundlestore agent data transfers.
//!
//! Every socket exchange starts with a length-prefixed [`Header`] frame,
//! followed by the raw bundle bytes. Persist requests are answered with a
//! length-prefixed [`Response`] frame once the agent has stored the bundle.
//!
//! # Wire format
//!
//! See [`codec`] for the frame layout.

pub mod codec;
pub mod constants;
pub mod error;
pub mod header;
pub mod response;
pub mod types;

pub use codec::{
    HeaderCodec, ResponseCodec, encode_header, encode_response, try_decode_header,
    try_decode_response,
};
pub use constants::{FRAME_PREFIX_LEN, MAX_FRAME_SIZE, STATUS_ERROR, STATUS_OK};
pub use error::ProtocolError;
pub use header::Header;
pub use response::Response;
pub use types::{Operation, StorageFormat};
