/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest frame body accepted by the decoder (1 MiB).
///
/// Headers and responses carry a handful of short strings; anything larger
/// is treated as a corrupt length prefix rather than buffered.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Response status: the operation succeeded.
pub const STATUS_OK: i32 = 0;

/// Response status: the operation failed; see the response message.
pub const STATUS_ERROR: i32 = 1;
