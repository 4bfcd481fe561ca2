//! One peer's WebSocket session: handshake, message reassembly, ping/pong and
//! the closing handshake, layered over a [`Transport`].

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time;
use tracing::{debug, trace, warn};

use super::assembler::FrameAssembler;
use super::consts::{CLOSE_NORMAL, FRAME_SIZE, MAX_CONTROL_PAYLOAD};
use super::frame::{CloseReason, Frame, Opcode};
use super::handshake::{
    build_request, generate_nonce, receive_as_client, receive_as_server, HttpHead, Rejection,
    HEAD_TERMINATOR,
};
use crate::error::{ConnectionError, Error, FrameError, HandshakeError};
use crate::transport::Transport;
use crate::Result;

/// Heads longer than this without a blank line fail the handshake.
const MAX_HANDSHAKE_LEN: usize = 8 * 1024;

/// Default bound on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Connection lifecycle. Ordered, so `state < State::Closing` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Which end of the opening handshake this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted peer: answers the upgrade request, sends unmasked frames.
    Server,
    /// Outbound peer: sends the upgrade request, masks every frame.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Text,
    Binary,
}

pub struct Connection<S> {
    stream: S,
    role: Role,
    state: State,
    peer: Option<SocketAddr>,
    /// Supported (server) or requested (client) sub-protocols.
    protocols: Vec<String>,
    protocol: Option<String>,
    nonce: Option<String>,
    handshake_buffer: BytesMut,
    /// Reused across reads; grows to the largest `max` asked for.
    read_buffer: BytesMut,
    /// Bound on every write; `None` waits as long as the peer takes.
    write_timeout: Option<Duration>,
    assembler: FrameAssembler,
    max_message_len: usize,
    in_progress: Option<MessageKind>,
    text_buffer: Vec<u8>,
    binary_buffer: Vec<u8>,
    text_messages: Vec<String>,
    binary_messages: Vec<Bytes>,
    peer_close: Option<CloseReason>,
}

impl<S: Transport> Connection<S> {
    /// Wrap an accepted stream. The peer's upgrade request is expected next.
    pub fn accept(stream: S, protocols: Vec<String>) -> Self {
        Self::new(stream, Role::Server, protocols)
    }

    /// Wrap an outbound stream; call [`start_handshake`](Self::start_handshake) next.
    pub fn client(stream: S, protocols: Vec<String>) -> Self {
        Self::new(stream, Role::Client, protocols)
    }

    fn new(stream: S, role: Role, protocols: Vec<String>) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            role,
            state: State::Connecting,
            peer,
            protocols,
            protocol: None,
            nonce: None,
            handshake_buffer: BytesMut::new(),
            read_buffer: BytesMut::new(),
            write_timeout: None,
            assembler: FrameAssembler::with_max_payload(DEFAULT_MAX_MESSAGE_LEN),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            in_progress: None,
            text_buffer: Vec::new(),
            binary_buffer: Vec::new(),
            text_messages: Vec::new(),
            binary_messages: Vec::new(),
            peer_close: None,
        }
    }

    /// Bound the size of a single reassembled message.
    pub fn with_max_message_len(mut self, limit: usize) -> Self {
        self.max_message_len = limit;
        self.assembler = FrameAssembler::with_max_payload(limit);
        self
    }

    /// Fail and force-close the connection when a write takes longer than `limit`.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = Some(limit);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Sub-protocol agreed during the handshake.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Status and reason from the peer's CLOSE frame, once received.
    pub fn peer_close_reason(&self) -> Option<&CloseReason> {
        self.peer_close.as_ref()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Wait for the underlying stream to become readable.
    pub async fn readable(&self) -> Result<()> {
        Ok(self.stream.readable().await?)
    }

    /// Whether the peer has shut down its write side: a non-consuming peek
    /// that finds end of stream. `None` when nothing can be told yet.
    pub fn peer_closed(&self) -> Option<bool> {
        let mut peeked = [0u8; 1];
        match self.stream.try_peek(&mut peeked) {
            Ok(n) => Some(n == 0),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(_) => Some(true),
        }
    }

    /// Send the opening request. The response is consumed by [`read`](Self::read).
    pub async fn start_handshake(&mut self, host: &str, port: u16, resource: &str) -> Result<()> {
        let nonce = generate_nonce();
        let request = build_request(host, port, resource, &nonce, &self.protocols);
        trace!(%request, "sending opening handshake");
        self.nonce = Some(nonce);
        self.state = State::Connecting;
        self.write_raw(request.as_bytes()).await
    }

    /// Read up to `max` bytes and process them.
    ///
    /// While connecting, bytes accumulate until the blank line ending the
    /// handshake head; anything after it is frame data. Returns whether at
    /// least one complete text or binary message is queued.
    pub async fn read(&mut self, max: usize) -> Result<bool> {
        if self.state == State::Closed {
            return Ok(self.has_messages());
        }

        if self.read_buffer.len() < max {
            self.read_buffer.resize(max, 0);
        }
        let n = match self.stream.try_read(&mut self.read_buffer[..max]) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(self.has_messages())
            }
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            debug!(peer = ?self.peer, state = ?self.state, "end of stream");
            self.close().await;
            return Ok(self.has_messages());
        }
        trace!(
            peer = ?self.peer,
            bytes = n,
            raw = %hex::encode(&self.read_buffer[..n]),
            "read"
        );

        let frames = if self.state == State::Connecting {
            self.handshake_buffer.extend_from_slice(&self.read_buffer[..n]);
            let Some(pos) = find(&self.handshake_buffer, HEAD_TERMINATOR) else {
                if self.handshake_buffer.len() > MAX_HANDSHAKE_LEN {
                    return self.handshake_too_long().await;
                }
                return Ok(false);
            };
            let head = self.handshake_buffer.split_to(pos + HEAD_TERMINATOR.len());
            let rest = self.handshake_buffer.split();
            self.handle_handshake(&head[..pos]).await?;
            if self.state > State::Connecting && !rest.is_empty() {
                self.assembler.parse(&rest)?
            } else {
                Vec::new()
            }
        } else {
            self.assembler.parse(&self.read_buffer[..n])?
        };

        for frame in frames {
            self.handle_frame(frame).await?;
            if self.state == State::Closed {
                break;
            }
        }

        Ok(self.has_messages())
    }

    /// Send `message` as a text message, failing before any write if it is not UTF-8.
    pub async fn write_text(&mut self, message: impl AsRef<[u8]>) -> Result<()> {
        let message = message.as_ref();
        std::str::from_utf8(message)?;
        self.write_message(Opcode::Text, message).await
    }

    pub async fn write_binary(&mut self, message: impl AsRef<[u8]>) -> Result<()> {
        self.write_message(Opcode::Binary, message.as_ref()).await
    }

    /// Begin the closing handshake: send CLOSE and shut down the write half.
    ///
    /// No-op once closing. A connection still handshaking is closed outright.
    pub async fn start_close(&mut self, code: u16, reason: &str) -> Result<()> {
        match self.state {
            State::Closing | State::Closed => Ok(()),
            State::Connecting => {
                self.close().await;
                Ok(())
            }
            State::Open => {
                let reason = truncate_reason(reason);
                debug!(peer = ?self.peer, code, reason, "starting close");
                self.state = State::Closing;
                let sent = self.send_frame(Frame::close(code, reason)).await;
                if let Err(e) = self.stream.shutdown().await {
                    debug!(peer = ?self.peer, error = %e, "shutdown after close frame failed");
                }
                sent
            }
        }
    }

    /// Shut down and mark closed without waiting for the peer.
    pub async fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!(peer = ?self.peer, error = %e, "shutdown on close failed");
        }
        self.state = State::Closed;
        debug!(peer = ?self.peer, "connection closed");
    }

    pub async fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::ping(payload)).await
    }

    /// Drain completed text messages.
    pub fn take_text_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.text_messages)
    }

    /// Drain completed binary messages.
    pub fn take_binary_messages(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.binary_messages)
    }

    pub fn has_messages(&self) -> bool {
        !self.text_messages.is_empty() || !self.binary_messages.is_empty()
    }

    async fn handle_handshake(&mut self, head: &[u8]) -> Result<()> {
        match self.role {
            Role::Server => {
                let answer = HttpHead::parse(head)
                    .map_err(|e| Rejection::bad_request(e.to_string()))
                    .and_then(|head| receive_as_server(&head, &self.protocols));
                match answer {
                    Ok(accepted) => {
                        self.write_raw(accepted.response.as_bytes()).await?;
                        self.protocol = accepted.protocol;
                        self.state = State::Open;
                        debug!(peer = ?self.peer, protocol = ?self.protocol, "handshake complete");
                        Ok(())
                    }
                    Err(rejection) => {
                        if let Err(e) = self.write_raw(rejection.response.as_bytes()).await {
                            debug!(peer = ?self.peer, error = %e, "writing handshake rejection failed");
                        }
                        self.close().await;
                        Err(HandshakeError::from(rejection).into())
                    }
                }
            }
            Role::Client => {
                let nonce = self.nonce.as_deref().unwrap_or_default();
                let validated = HttpHead::parse(head)
                    .and_then(|head| receive_as_client(&head, nonce, &self.protocols));
                match validated {
                    Ok(protocol) => {
                        self.protocol = protocol;
                        self.nonce = None;
                        self.state = State::Open;
                        debug!(peer = ?self.peer, protocol = ?self.protocol, "handshake complete");
                        Ok(())
                    }
                    Err(e) => {
                        self.close().await;
                        Err(e.into())
                    }
                }
            }
        }
    }

    async fn handshake_too_long(&mut self) -> Result<bool> {
        let message = "Handshake head is too long.";
        if self.role == Role::Server {
            let response = Rejection::bad_request(message).response;
            if let Err(e) = self.write_raw(response.as_bytes()).await {
                debug!(peer = ?self.peer, error = %e, "writing handshake rejection failed");
            }
        }
        self.handshake_buffer.clear();
        self.close().await;
        Err(HandshakeError::Failure(message.into()).into())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        trace!(
            peer = ?self.peer,
            opcode = ?frame.opcode,
            fin = frame.fin,
            len = frame.payload.len(),
            "frame"
        );
        if frame.rsv != 0 {
            return Err(FrameError::ReservedBits(frame.rsv).into());
        }
        match frame.opcode {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => self.handle_data(frame),
            Opcode::Close => {
                let reason = CloseReason::parse(&frame.payload)?;
                debug!(peer = ?self.peer, code = ?reason.code, reason = %reason.reason, "close frame received");
                let code = reason.code.unwrap_or(CLOSE_NORMAL);
                self.peer_close = Some(reason);
                if self.state == State::Closing {
                    self.close().await;
                } else if let Err(e) = self.start_close(code, "").await {
                    debug!(peer = ?self.peer, error = %e, "close reply not sent");
                    self.close().await;
                }
                Ok(())
            }
            Opcode::Ping => {
                if self.state == State::Open {
                    self.send_frame(Frame::pong(frame.payload)).await?;
                }
                Ok(())
            }
            Opcode::Pong => Ok(()),
            Opcode::Reserved(bits) => Err(FrameError::ReservedOpcode(bits).into()),
        }
    }

    fn handle_data(&mut self, frame: Frame) -> Result<()> {
        let kind = match (frame.opcode, self.in_progress) {
            (Opcode::Continuation, Some(kind)) => kind,
            (Opcode::Continuation, None) => return Err(FrameError::UnexpectedContinuation.into()),
            (Opcode::Text, None | Some(MessageKind::Text)) => MessageKind::Text,
            (Opcode::Binary, None | Some(MessageKind::Binary)) => MessageKind::Binary,
            (op, _) => return Err(FrameError::InterleavedMessage(op.as_u8()).into()),
        };

        let buffer = match kind {
            MessageKind::Text => &mut self.text_buffer,
            MessageKind::Binary => &mut self.binary_buffer,
        };
        let len = buffer.len() + frame.payload.len();
        if len > self.max_message_len {
            buffer.clear();
            self.in_progress = None;
            return Err(FrameError::MessageTooLarge {
                len: len as u64,
                limit: self.max_message_len,
            }
            .into());
        }
        buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            self.in_progress = Some(kind);
            return Ok(());
        }
        self.in_progress = None;

        match kind {
            MessageKind::Text => {
                let bytes = std::mem::take(&mut self.text_buffer);
                let text = String::from_utf8(bytes).map_err(|e| Error::from(e.utf8_error()))?;
                self.text_messages.push(text);
            }
            MessageKind::Binary => {
                let bytes = std::mem::take(&mut self.binary_buffer);
                self.binary_messages.push(Bytes::from(bytes));
            }
        }
        Ok(())
    }

    async fn write_message(&mut self, opcode: Opcode, message: &[u8]) -> Result<()> {
        if self.state != State::Open {
            return Err(ConnectionError::NotOpen(self.state).into());
        }

        let mut chunks: Vec<&[u8]> = message.chunks(FRAME_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;

        let mut wire = BytesMut::with_capacity(message.len() + chunks.len() * 14);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let op = if i == 0 { opcode } else { Opcode::Continuation };
            let frame = self.outgoing(Frame::new(op, Bytes::copy_from_slice(chunk), i == last));
            wire.extend_from_slice(&frame.encode());
        }
        self.write_raw(&wire).await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let frame = self.outgoing(frame);
        self.write_raw(&frame.encode()).await
    }

    /// Every write goes through here. A write that outlives the write
    /// timeout leaves the stream mid-frame, so the connection is closed.
    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let Some(limit) = self.write_timeout else {
            return Ok(self.stream.write_all(data).await?);
        };
        match time::timeout(limit, self.stream.write_all(data)).await {
            Ok(written) => Ok(written?),
            Err(_) => {
                warn!(peer = ?self.peer, len = data.len(), "write timed out");
                self.close().await;
                Err(ConnectionError::Timeout(limit).into())
            }
        }
    }

    fn outgoing(&self, frame: Frame) -> Frame {
        match self.role {
            Role::Client => frame.masked(),
            Role::Server => frame,
        }
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Cut `reason` so the close payload fits a control frame.
fn truncate_reason(reason: &str) -> &str {
    let max = MAX_CONTROL_PAYLOAD as usize - 2;
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
