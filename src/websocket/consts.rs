//! Constants for the WebSocket wire protocol (RFC 6455) and the notifier relay.

/// GUID appended to `Sec-WebSocket-Key` before hashing (RFC 6455 §4.2.2).
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const VERSION: u8 = 13;

/// Sub-protocol spoken by notifier senders, listeners and the server.
pub const PROTOCOL: &str = "notifier";

/// Outgoing messages are split into frames of at most this many payload bytes.
pub const FRAME_SIZE: usize = 2048;

/// Longest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_DATA_TYPE: u16 = 1003;
pub const CLOSE_ENCODING_ERROR: u16 = 1007;
pub const CLOSE_TOO_LARGE: u16 = 1009;
pub const CLOSE_UNEXPECTED_ERROR: u16 = 1011;
