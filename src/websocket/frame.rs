//! A single WebSocket frame (RFC 6455 §5.2) and its resumable parser.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::consts::{
    MAX_CONTROL_PAYLOAD, OP_BINARY, OP_CLOSE, OP_CONTINUATION, OP_PING, OP_PONG, OP_TEXT,
};
use crate::error::FrameError;

/// Longest possible header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
const MAX_HEADER_LEN: usize = 14;

/// Upper bound on what the parser preallocates for a payload whose length the peer claims.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// 0x3-0x7 and 0xB-0xF.
    Reserved(u8),
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0f {
            OP_CONTINUATION => Self::Continuation,
            OP_TEXT => Self::Text,
            OP_BINARY => Self::Binary,
            OP_CLOSE => Self::Close,
            OP_PING => Self::Ping,
            OP_PONG => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => OP_CONTINUATION,
            Self::Text => OP_TEXT,
            Self::Binary => OP_BINARY,
            Self::Close => OP_CLOSE,
            Self::Ping => OP_PING,
            Self::Pong => OP_PONG,
            Self::Reserved(bits) => bits & 0x0f,
        }
    }

    /// Control opcodes have the high bit of the nibble set, reserved ones included.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// XOR `data` with the cycling 4-byte `key`, starting `phase` bytes into the keystream.
///
/// Applying the same key and phase twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4], phase: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(phase + i) % 4];
    }
}

/// A complete frame. `payload` is always held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    /// RSV1-3 in the low three bits.
    pub rsv: u8,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload, true)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload, true)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload, true)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload, true)
    }

    /// Close frame: 2-byte big-endian status then UTF-8 reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, buf.freeze(), true)
    }

    /// Mask with the given key when encoded.
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Mask with a fresh random key when encoded.
    pub fn masked(self) -> Self {
        self.with_mask(rand::random())
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len();
        let mut buf = BytesMut::with_capacity(MAX_HEADER_LEN + len);

        let fin = if self.fin { 0x80 } else { 0x00 };
        buf.put_u8(fin | ((self.rsv & 0x07) << 4) | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            buf.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }

        match self.mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], key, 0);
            }
            None => buf.put_slice(&self.payload),
        }
        buf.freeze()
    }
}

/// A frame being read from a byte stream, fed in arbitrary chunks.
///
/// The header length is only known once byte 1 (mask bit and 7-bit length)
/// has been consumed, so the parser collects header bytes one at a time
/// until it reaches the computed length, then switches to payload bytes.
#[derive(Debug)]
pub struct PartialFrame {
    header: [u8; MAX_HEADER_LEN],
    /// Bytes of this frame consumed so far, header included.
    cursor: usize,
    header_len: usize,
    header_done: bool,
    payload_len: u64,
    payload: BytesMut,
    max_payload: Option<usize>,
}

impl Default for PartialFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialFrame {
    pub fn new() -> Self {
        Self {
            header: [0; MAX_HEADER_LEN],
            cursor: 0,
            header_len: 2,
            header_done: false,
            payload_len: 0,
            payload: BytesMut::new(),
            max_payload: None,
        }
    }

    /// Reject frames whose declared payload exceeds `limit` as soon as the header is read.
    pub fn with_max_payload(mut self, limit: Option<usize>) -> Self {
        self.max_payload = limit;
        self
    }

    /// Consume as much of `chunk` as belongs to this frame.
    ///
    /// Returns whether the frame is now complete, and the bytes past its end.
    pub fn parse<'a>(&mut self, chunk: &'a [u8]) -> Result<(bool, &'a [u8]), FrameError> {
        let mut rest = chunk;

        while !self.header_done {
            let Some((&byte, tail)) = rest.split_first() else {
                return Ok((false, rest));
            };
            rest = tail;
            self.header[self.cursor] = byte;
            self.cursor += 1;

            if self.cursor == 2 {
                let extended = match byte & 0x7f {
                    126 => 2,
                    127 => 8,
                    _ => 0,
                };
                let mask = if byte & 0x80 != 0 { 4 } else { 0 };
                self.header_len = 2 + extended + mask;
            }
            if self.cursor >= 2 && self.cursor == self.header_len {
                self.finish_header()?;
            }
        }

        let remaining = self.payload_len - self.payload.len() as u64;
        let take = remaining.min(rest.len() as u64) as usize;
        let (body, leftover) = rest.split_at(take);

        let start = self.payload.len();
        self.payload.extend_from_slice(body);
        if let Some(key) = self.mask_key() {
            apply_mask(&mut self.payload[start..], key, self.cursor - self.header_len);
        }
        self.cursor += take;

        Ok((self.is_complete(), leftover))
    }

    pub fn is_complete(&self) -> bool {
        self.header_done && self.payload.len() as u64 == self.payload_len
    }

    /// Whether any byte of this frame has been consumed yet.
    pub fn is_started(&self) -> bool {
        self.cursor > 0
    }

    /// Take the finished frame. Only meaningful once [`is_complete`](Self::is_complete).
    pub fn into_frame(self) -> Frame {
        let mask = self.mask_key();
        Frame {
            fin: self.header[0] & 0x80 != 0,
            rsv: (self.header[0] >> 4) & 0x07,
            opcode: Opcode::from_bits(self.header[0]),
            mask,
            payload: self.payload.freeze(),
        }
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        if self.cursor < 2 || self.header[1] & 0x80 == 0 {
            return None;
        }
        let at = self.header_len - 4;
        Some([
            self.header[at],
            self.header[at + 1],
            self.header[at + 2],
            self.header[at + 3],
        ])
    }

    fn finish_header(&mut self) -> Result<(), FrameError> {
        let h = &self.header;
        let opcode = Opcode::from_bits(h[0]);
        let fin = h[0] & 0x80 != 0;

        self.payload_len = match h[1] & 0x7f {
            126 => u16::from_be_bytes([h[2], h[3]]) as u64,
            127 => {
                let len = u64::from_be_bytes([h[2], h[3], h[4], h[5], h[6], h[7], h[8], h[9]]);
                if len >> 63 != 0 {
                    return Err(FrameError::InvalidLength);
                }
                len
            }
            len => len as u64,
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl(opcode.as_u8()));
            }
            if self.payload_len > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlTooLong(self.payload_len));
            }
        }
        if let Some(limit) = self.max_payload {
            if self.payload_len > limit as u64 {
                return Err(FrameError::MessageTooLarge {
                    len: self.payload_len,
                    limit,
                });
            }
        }

        tracing::trace!(
            opcode = ?opcode,
            fin,
            len = self.payload_len,
            header = %hex::encode(&h[..self.header_len]),
            "frame header"
        );

        self.header_done = true;
        self.payload
            .reserve((self.payload_len as usize).min(PREALLOC_LIMIT));
        Ok(())
    }
}

/// Decoded payload of a CLOSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseReason {
    /// An empty payload carries no code. A single byte cannot hold one and
    /// is rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        match payload {
            [] => Ok(Self::default()),
            [_] => Err(FrameError::TruncatedCloseCode),
            [hi, lo, rest @ ..] => Ok(Self {
                code: Some(u16::from_be_bytes([*hi, *lo])),
                reason: String::from_utf8_lossy(rest).into_owned(),
            }),
        }
    }
}
