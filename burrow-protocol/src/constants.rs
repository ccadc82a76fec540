//! Protocol constants

/// Maximum serialized control message body (length prefix is a `u16`)
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Size of the control message length prefix
pub const MESSAGE_HEADER_LEN: usize = 2;

/// Maximum session frame size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Size of the session frame length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload carried by a single session data frame
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;

/// Bytes a stream may have in flight before the receiver grants more credit
pub const STREAM_WINDOW: u32 = 256 * 1024;
