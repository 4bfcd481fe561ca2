//! Relay clients: a one-shot [`Sender`] and a long-lived [`Listener`].

mod listener;
mod sender;

use std::fmt;
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ConnectionError, Error};
use crate::websocket::{Connection, State};
use crate::Result;

pub use listener::Listener;
pub use sender::Sender;

/// Port used when a URL names none.
pub const DEFAULT_PORT: u16 = 3000;

/// A parsed `ws://host[:port][/resource]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host as written, brackets kept for IPv6 literals.
    pub host: String,
    pub port: u16,
    pub resource: String,
}

impl WsUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || Error::Url(url.to_string());

        let rest = match url.split_once("://") {
            Some(("ws", rest)) => rest,
            Some(("wss", _)) => {
                debug!(%url, "secure WebSocket URLs are not supported");
                return Err(invalid());
            }
            _ => return Err(invalid()),
        };

        let (authority, resource) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rfind(':') {
            Some(i) if !authority[i..].contains(']') => {
                let port = authority[i + 1..].parse().map_err(|_| invalid())?;
                (&authority[..i], port)
            }
            _ => (authority, DEFAULT_PORT),
        };
        if host.is_empty() || host == "[]" {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            resource: resource.to_string(),
        })
    }

    /// `host:port`, as accepted by `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws://{}:{}{}", self.host, self.port, self.resource)
    }
}

/// Open a TCP connection and complete the opening handshake, each step
/// bounded by `config.timeout`.
pub(crate) async fn connect(url: &WsUrl, config: &ClientConfig) -> Result<Connection<TcpStream>> {
    let addr = url.socket_addr();
    let stream = time::timeout(config.timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ConnectionError::Timeout(config.timeout))?
        .map_err(|source| ConnectionError::Connect {
            addr: addr.clone(),
            source,
        })?;
    debug!(%url, "connected");

    let mut conn = Connection::client(stream, config.protocols.clone());
    conn.start_handshake(&url.host, url.port, &url.resource).await?;

    let handshake = async {
        while conn.state() == State::Connecting {
            conn.readable().await?;
            conn.read(config.read_buffer_len).await?;
        }
        Ok::<_, Error>(())
    };
    match time::timeout(config.timeout, handshake).await {
        Ok(outcome) => outcome?,
        Err(_) => {
            conn.close().await;
            return Err(ConnectionError::Timeout(config.timeout).into());
        }
    }

    if conn.state() != State::Open {
        return Err(ConnectionError::Disconnected.into());
    }
    Ok(conn)
}

/// Start the closing handshake and wait up to `config.timeout` for the
/// server's reply. The connection is closed on return either way.
pub(crate) async fn disconnect(
    conn: &mut Connection<TcpStream>,
    code: u16,
    reason: &str,
    config: &ClientConfig,
) -> Result<()> {
    let sent = conn.start_close(code, reason).await;

    let reply = async {
        while conn.state() != State::Closed {
            conn.readable().await?;
            conn.read(config.read_buffer_len).await?;
        }
        Ok::<_, Error>(())
    };
    match time::timeout(config.timeout, reply).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "closing handshake cut short"),
        Err(_) => {
            let e = ConnectionError::Timeout(config.timeout);
            debug!(error = %e, "no close reply");
        }
    }
    conn.close().await;
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn parses_full_and_default_forms() {
        assert_eq!(
            WsUrl::parse("ws://example.org:8080/notify").unwrap(),
            WsUrl {
                host: "example.org".into(),
                port: 8080,
                resource: "/notify".into(),
            }
        );
        let url = WsUrl::parse("ws://localhost").unwrap();
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.resource, "/");
        assert_eq!(url.to_string(), "ws://localhost:3000/");

        let v6 = WsUrl::parse("ws://[::1]:4000/").unwrap();
        assert_eq!(v6.host, "[::1]");
        assert_eq!(v6.port, 4000);
        assert_eq!(v6.socket_addr(), "[::1]:4000");
        assert_eq!(WsUrl::parse("ws://[::1]").unwrap().port, DEFAULT_PORT);
    }

    #[test]
    fn rejects_bad_urls() {
        for url in [
            "http://localhost",
            "localhost:3000",
            "ws://",
            "ws://:3000/",
            "ws://host:port/",
            "ws://host:70000",
            "wss://secure.example.org/",
        ] {
            let err = assert_err!(WsUrl::parse(url));
            assert!(matches!(err, Error::Url(_)), "{url}");
        }
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = WsUrl::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();
        let err = assert_err!(connect(&url, &ClientConfig::default()).await);
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = WsUrl::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();
        let config = ClientConfig {
            timeout: std::time::Duration::from_millis(100),
            ..ClientConfig::default()
        };

        let err = assert_err!(connect(&url, &config).await);
        assert!(matches!(err, Error::Connection(ConnectionError::Timeout(_))));
        drop(listener);
    }
}
