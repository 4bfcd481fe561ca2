use thiserror::Error;

use crate::websocket::consts::{
    CLOSE_ENCODING_ERROR, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_LARGE, CLOSE_UNEXPECTED_ERROR,
};

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while speaking WebSocket or relaying notifications.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid UTF-8 in text message: {0}")]
    Utf8Encoding(#[from] std::str::Utf8Error),

    #[error("relay message: {0}")]
    Message(String),

    #[error("invalid WebSocket address {0}: should be in the form ws://host[:port][/resource]")]
    Url(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Close status to send when this error fails a single connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Utf8Encoding(_) => CLOSE_ENCODING_ERROR,
            Self::Frame(FrameError::MessageTooLarge { .. }) => CLOSE_TOO_LARGE,
            Self::Frame(_) | Self::Handshake(_) | Self::Message(_) => CLOSE_PROTOCOL_ERROR,
            _ => CLOSE_UNEXPECTED_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Connection(ConnectionError::Io(e))
    }
}

/// Transport-level errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("disconnected")]
    Disconnected,

    #[error("connection is {0:?}, not open")]
    NotOpen(crate::websocket::State),
}

/// Opening handshake failures.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake failed: {0}")]
    Failure(String),

    #[error("request rejected with {status}: {message}")]
    Rejected { status: u16, message: String },

    /// No mutually supported sub-protocol.
    #[error("requested sub-protocols {requested:?}, server offered {offered:?}")]
    Protocol {
        requested: Vec<String>,
        offered: Option<String>,
    },
}

/// Wire format violations detected while parsing frames or reassembling messages.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    #[error("reserved bits {0:#05b} set without a negotiated extension")]
    ReservedBits(u8),

    #[error("control frame {0:#x} is fragmented")]
    FragmentedControl(u8),

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(u64),

    #[error("close frame payload of one byte cannot hold a status code")]
    TruncatedCloseCode,

    #[error("64-bit payload length has its most significant bit set")]
    InvalidLength,

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new {0:#x} data frame while a fragmented message is in progress")]
    InterleavedMessage(u8),

    #[error("message of {len} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { len: u64, limit: usize },
}
