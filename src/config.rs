//! Server and client settings.
//!
//! Both configs deserialize from any serde format; durations are given in
//! milliseconds and every field has a default.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

use crate::websocket::connection::DEFAULT_MAX_MESSAGE_LEN;
use crate::websocket::consts::{FRAME_SIZE, PROTOCOL};

fn default_protocols() -> Vec<String> {
    vec![PROTOCOL.to_string()]
}

/// Relay server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Sub-protocols the server is willing to speak.
    pub protocols: Vec<String>,
    /// Bytes read per readiness event.
    pub read_buffer_len: usize,
    /// Bound on any single write to a client. A client that stalls past it
    /// is force-closed.
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// How long a closing connection may wait for the peer's CLOSE.
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            protocols: default_protocols(),
            read_buffer_len: FRAME_SIZE,
            write_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(2),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

impl ServerConfig {
    /// Defaults, listening on `port` on all interfaces.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            ..Self::default()
        }
    }
}

/// Sender and listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connect timeout, also the wait for the server's CLOSE reply.
    #[serde(with = "millis")]
    pub timeout: Duration,
    pub protocols: Vec<String>,
    pub read_buffer_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            protocols: default_protocols(),
            read_buffer_len: FRAME_SIZE,
        }
    }
}

/// How much the relay reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    None,
    /// Failures only.
    #[default]
    Errors,
    /// Plus every relayed notification.
    Messages,
    /// Plus per-client connects, handshakes and closes.
    Client,
    /// Plus frame headers and raw bytes.
    All,
}

impl From<Verbosity> for LevelFilter {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::None => LevelFilter::OFF,
            Verbosity::Errors => LevelFilter::WARN,
            Verbosity::Messages => LevelFilter::INFO,
            Verbosity::Client => LevelFilter::DEBUG,
            Verbosity::All => LevelFilter::TRACE,
        }
    }
}

impl From<u8> for Verbosity {
    fn from(level: u8) -> Self {
        match level {
            0 => Verbosity::None,
            1 => Verbosity::Errors,
            2 => Verbosity::Messages,
            3 => Verbosity::Client,
            _ => Verbosity::All,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.protocols, vec!["notifier"]);
        assert_eq!(config.read_buffer_len, 2048);
        assert_eq!(ServerConfig::with_port(8080).bind_addr.port(), 8080);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"bind_addr":"127.0.0.1:9000","write_timeout":250}"#)
                .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.write_timeout, Duration::from_millis(250));
        assert_eq!(config.max_message_len, DEFAULT_MAX_MESSAGE_LEN);

        let client: ClientConfig = serde_json::from_str(r#"{"timeout":500}"#).unwrap();
        assert_eq!(client.timeout, Duration::from_millis(500));
        assert_eq!(client.protocols, vec!["notifier"]);
        assert_eq!(
            serde_json::to_value(&client).unwrap()["timeout"],
            serde_json::json!(500)
        );
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(LevelFilter::from(Verbosity::None), LevelFilter::OFF);
        assert_eq!(LevelFilter::from(Verbosity::default()), LevelFilter::WARN);
        assert_eq!(LevelFilter::from(Verbosity::from(4)), LevelFilter::TRACE);
        assert!(Verbosity::Client > Verbosity::Messages);
        let v: Verbosity = serde_json::from_str(r#""messages""#).unwrap();
        assert_eq!(v, Verbosity::Messages);
    }
}
