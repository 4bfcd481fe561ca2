//! Opening handshake (RFC 6455 §4): HTTP/1.1 upgrade request and 101 response.
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//!
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;

use super::consts::{GUID, VERSION};
use crate::error::HandshakeError;

/// Terminates the head of an HTTP request or response.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// `base64(sha1(key + GUID))`, used by the server to answer and the client to verify.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Fresh random 16-byte `Sec-WebSocket-Key`, base64 encoded.
pub fn generate_nonce() -> String {
    base64::engine::general_purpose::STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Build the client's opening request.
pub fn build_request(
    host: &str,
    port: u16,
    resource: &str,
    nonce: &str,
    protocols: &[String],
) -> String {
    let mut request = format!("GET {resource} HTTP/1.1\r\n");
    if port == 80 {
        let _ = write!(request, "Host: {host}\r\n");
    } else {
        let _ = write!(request, "Host: {host}:{port}\r\n");
    }
    let _ = write!(
        request,
        "Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {nonce}\r\n\
         Sec-WebSocket-Version: {VERSION}\r\n"
    );
    if !protocols.is_empty() {
        let _ = write!(request, "Sec-WebSocket-Protocol: {}\r\n", protocols.join(", "));
    }
    request.push_str("\r\n");
    request
}

/// Start line and headers of an HTTP/1.1 request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parse everything before the blank line (the terminator itself excluded).
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| HandshakeError::Failure("handshake is not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n");
        let start_line = lines.next().unwrap_or_default().trim().to_string();
        if start_line.is_empty() {
            return Err(HandshakeError::Failure("empty start line".into()));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                HandshakeError::Failure(format!("malformed header line '{line}'"))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            start_line,
            headers,
        })
    }

    /// First value of the named header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request method, when this is a request.
    pub fn method(&self) -> &str {
        self.start_line.split(' ').next().unwrap_or_default()
    }

    /// Status code, when this is a response.
    pub fn status(&self) -> Option<u16> {
        let mut parts = self.start_line.split(' ');
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }
}

/// Successful server-side handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Full 101 response to write back.
    pub response: String,
    pub protocol: Option<String>,
}

/// Failed server-side handshake; `response` still has to be written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub message: String,
    pub response: String,
}

impl Rejection {
    pub fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        let response = format!(
            "HTTP/1.1 400 Bad Request\r\nX-WebSocket-Message: {message}\r\n\r\n"
        );
        Self {
            status: 400,
            message,
            response,
        }
    }

    fn upgrade_required() -> Self {
        let message = "Client request protocol version is unsupported.".to_string();
        let response = format!(
            "HTTP/1.1 426 Upgrade Required\r\n\
             Sec-WebSocket-Version: {VERSION}\r\n\
             X-WebSocket-Message: {message}\r\n\r\n"
        );
        Self {
            status: 426,
            message,
            response,
        }
    }
}

impl From<Rejection> for HandshakeError {
    fn from(r: Rejection) -> Self {
        HandshakeError::Rejected {
            status: r.status,
            message: r.message,
        }
    }
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

/// Validate a client's opening request and produce the response to send.
///
/// The first sub-protocol the client lists that appears in `supported` is
/// selected. No match only omits the `Sec-WebSocket-Protocol` header.
pub fn receive_as_server(head: &HttpHead, supported: &[String]) -> Result<Accepted, Rejection> {
    if head.method() != "GET" {
        return Err(Rejection::bad_request("Request method must be GET."));
    }
    if head.header("Host").is_none() {
        return Err(Rejection::bad_request(
            "Client request Host header is missing.",
        ));
    }
    if !has_token(head.header("Upgrade"), "websocket") {
        return Err(Rejection::bad_request(
            "Client request Upgrade header is missing or not set to 'websocket'.",
        ));
    }
    if !has_token(head.header("Connection"), "upgrade") {
        return Err(Rejection::bad_request(
            "Client request Connection header is missing or not set to 'Upgrade'.",
        ));
    }
    let Some(key) = head.header("Sec-WebSocket-Key").filter(|k| !k.is_empty()) else {
        return Err(Rejection::bad_request(
            "Client request Sec-WebSocket-Key header is missing.",
        ));
    };
    let Some(version) = head.header("Sec-WebSocket-Version") else {
        return Err(Rejection::bad_request(
            "Client request Sec-WebSocket-Version header is missing.",
        ));
    };
    if version.parse::<u8>().ok() != Some(VERSION) {
        return Err(Rejection::upgrade_required());
    }

    let protocol = head.header("Sec-WebSocket-Protocol").and_then(|requested| {
        requested
            .split(',')
            .map(str::trim)
            .find(|p| supported.iter().any(|s| s == p))
            .map(str::to_string)
    });

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    if let Some(p) = &protocol {
        let _ = write!(response, "Sec-WebSocket-Protocol: {p}\r\n");
    }
    response.push_str("\r\n");

    Ok(Accepted { response, protocol })
}

/// Validate the server's response to a request sent with `nonce`.
///
/// Returns the negotiated sub-protocol, if any.
pub fn receive_as_client(
    head: &HttpHead,
    nonce: &str,
    requested: &[String],
) -> Result<Option<String>, HandshakeError> {
    if head.status() != Some(101) {
        return Err(HandshakeError::Failure(format!(
            "unexpected response '{}'",
            head.start_line
        )));
    }
    let Some(accept) = head.header("Sec-WebSocket-Accept") else {
        return Err(HandshakeError::Failure(
            "Sec-WebSocket-Accept header missing.".into(),
        ));
    };
    if !has_token(head.header("Upgrade"), "websocket") {
        return Err(HandshakeError::Failure(
            "Upgrade header missing or not set to \"websocket\".".into(),
        ));
    }
    if !has_token(head.header("Connection"), "upgrade") {
        return Err(HandshakeError::Failure(
            "Connection header missing or not set to \"Upgrade\".".into(),
        ));
    }
    if accept.trim() != accept_key(nonce) {
        return Err(HandshakeError::Failure(format!(
            "Sec-WebSocket-Accept header \"{accept}\" does not validate against nonce \"{nonce}\""
        )));
    }

    let offered = head.header("Sec-WebSocket-Protocol").map(str::trim);
    if requested.is_empty() {
        return Ok(offered.map(str::to_string));
    }
    match offered {
        Some(p) if requested.iter().any(|r| r == p) => Ok(Some(p.to_string())),
        _ => Err(HandshakeError::Protocol {
            requested: requested.to_vec(),
            offered: offered.map(str::to_string),
        }),
    }
}
