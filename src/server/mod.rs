//! Notification relay server.
//!
//! One task owns the listening socket and every connection. Each loop
//! iteration waits for the first of: shutdown, a new connection, a readable
//! connection, or a closing deadline. Listeners register with
//! `{"action":"listen"}`; any other action from a sender is relayed to all
//! listeners and the sender is closed.

pub mod message;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::websocket::consts::{
    CLOSE_DATA_TYPE, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};
use crate::websocket::{Connection, State};
use crate::Result;

pub use message::RelayMessage;

/// Server-assigned handle for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Wake {
    Shutdown,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Ready(Vec<ConnectionId>),
    Expired,
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    clients: HashMap<ConnectionId, Connection<TcpStream>>,
    listen_clients: HashSet<ConnectionId>,
    /// When each CLOSING connection gets force-closed.
    closing: HashMap<ConnectionId, Instant>,
    next_id: u64,
    moribund: bool,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        info!(addr = %config.bind_addr, "relay listening");
        Ok(Self {
            listener,
            config,
            clients: HashMap::new(),
            listen_clients: HashSet::new(),
            closing: HashMap::new(),
            next_id: 0,
            moribund: false,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a `shutdown` action, SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until a `shutdown` action or until `shutdown` completes.
    ///
    /// Remaining connections are sent a going-away close and the listening
    /// socket is released on return. An accept failure ends the loop with an
    /// error.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.serve(shutdown).await
    }

    async fn serve<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let outcome = loop {
            if self.moribund {
                break Ok(());
            }
            match self.wait(&mut shutdown).await {
                Wake::Shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                Wake::Accepted(Ok((stream, addr))) => self.admit(stream, addr),
                Wake::Accepted(Err(e)) => {
                    error!(error = %e, "accept failed");
                    break Err(ConnectionError::Io(e).into());
                }
                Wake::Ready(ids) => {
                    for id in ids {
                        self.service(id).await;
                    }
                }
                Wake::Expired => self.expire_closing().await,
            }
            self.track_closing();
            self.reap();
        };

        for (id, conn) in &mut self.clients {
            if let Err(e) = conn.start_close(CLOSE_GOING_AWAY, "Server shutting down.").await {
                debug!(client = %id, error = %e, "close on shutdown failed");
            }
        }
        info!(clients = self.clients.len(), "relay stopped");
        outcome
    }

    async fn wait<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> Wake
    where
        F: Future<Output = ()>,
    {
        let mut ready: FuturesUnordered<_> = self
            .clients
            .iter()
            .filter(|(_, conn)| conn.state() != State::Closed)
            .map(|(id, conn)| {
                let id = *id;
                // Errors surface on the following read.
                conn.readable().map(move |_| id)
            })
            .collect();
        let deadline = self.closing.values().min().copied();

        tokio::select! {
            biased;
            _ = shutdown.as_mut() => Wake::Shutdown,
            accepted = self.listener.accept() => Wake::Accepted(accepted),
            Some(first) = ready.next(), if !ready.is_empty() => {
                let mut ids = vec![first];
                while let Some(Some(id)) = ready.next().now_or_never() {
                    ids.push(id);
                }
                Wake::Ready(ids)
            }
            _ = sleep_until(deadline) => Wake::Expired,
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let conn = Connection::accept(stream, self.config.protocols.clone())
            .with_max_message_len(self.config.max_message_len)
            .with_write_timeout(self.config.write_timeout);
        debug!(client = %id, peer = %addr, "accepted");
        self.clients.insert(id, conn);
    }

    async fn service(&mut self, id: ConnectionId) {
        let read_buffer_len = self.config.read_buffer_len;
        let Some(conn) = self.clients.get_mut(&id) else {
            return;
        };

        let peer_gone = conn.peer_closed() == Some(true);
        let was_open = conn.state() < State::Closing;

        if let Err(e) = conn.read(read_buffer_len).await {
            warn!(client = %id, peer = ?conn.peer_addr(), error = %e, "failing connection");
            if let Err(e) = conn.start_close(e.close_code(), &e.to_string()).await {
                debug!(client = %id, error = %e, "close after failure not sent");
            }
        }

        let texts = conn.take_text_messages();
        let binaries = conn.take_binary_messages();

        if was_open {
            for text in texts {
                if !self.dispatch(id, text).await {
                    break;
                }
            }
            if !binaries.is_empty() {
                warn!(client = %id, count = binaries.len(), "binary message rejected");
                self.start_close(id, CLOSE_DATA_TYPE, "Binary messages are not supported.")
                    .await;
            }
        }

        if peer_gone {
            if let Some(conn) = self.clients.get_mut(&id) {
                debug!(client = %id, "peer went away");
                conn.close().await;
            }
        }
    }

    /// Act on one relay message. Returns whether further messages from the
    /// same connection should be processed.
    async fn dispatch(&mut self, id: ConnectionId, text: String) -> bool {
        match RelayMessage::parse(&text) {
            Ok(RelayMessage::Listen) => {
                if self.listen_clients.insert(id) {
                    debug!(client = %id, "listener registered");
                }
                true
            }
            Ok(RelayMessage::Shutdown) => {
                info!(client = %id, "shutdown action received");
                self.start_close(id, CLOSE_NORMAL, "Server shutting down.")
                    .await;
                self.moribund = true;
                false
            }
            Ok(RelayMessage::Notify { action, .. }) => {
                let delivered = self.relay_notification(&text).await;
                info!(client = %id, %action, delivered, message = %text, "relayed");
                self.start_close(id, CLOSE_NORMAL, "Received message.").await;
                false
            }
            Err(e) => {
                warn!(client = %id, error = %e, "bad relay message");
                self.start_close(id, CLOSE_PROTOCOL_ERROR, "Invalid relay message.")
                    .await;
                false
            }
        }
    }

    /// Send `message` to every listener that is not closing. Returns how many
    /// listeners it reached.
    ///
    /// A listener whose write fails or exceeds the write timeout is
    /// force-closed and dropped from the listener set; the others still
    /// receive the message.
    pub async fn relay_notification(&mut self, message: &str) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for id in &self.listen_clients {
            let Some(conn) = self.clients.get_mut(id) else {
                continue;
            };
            if conn.state() >= State::Closing {
                continue;
            }
            match conn.write_text(message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(listener = %id, error = %e, "relay write failed");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.listen_clients.remove(&id);
            if let Some(conn) = self.clients.get_mut(&id) {
                conn.close().await;
            }
        }
        delivered
    }

    async fn start_close(&mut self, id: ConnectionId, code: u16, reason: &str) {
        if let Some(conn) = self.clients.get_mut(&id) {
            if let Err(e) = conn.start_close(code, reason).await {
                debug!(client = %id, error = %e, "close frame not sent");
            }
        }
    }

    fn track_closing(&mut self) {
        let close_timeout = self.config.close_timeout;
        for (id, conn) in &self.clients {
            if conn.state() == State::Closing {
                self.closing
                    .entry(*id)
                    .or_insert_with(|| Instant::now() + close_timeout);
            }
        }
    }

    async fn expire_closing(&mut self) {
        let now = Instant::now();
        let expired: Vec<_> = self
            .closing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.closing.remove(&id);
            if let Some(conn) = self.clients.get_mut(&id) {
                let e = ConnectionError::Timeout(self.config.close_timeout);
                debug!(client = %id, error = %e, "no close reply");
                conn.close().await;
            }
        }
    }

    fn reap(&mut self) {
        let closed: Vec<_> = self
            .clients
            .iter()
            .filter(|(_, conn)| conn.state() == State::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.clients.remove(&id);
            self.listen_clients.remove(&id);
            self.closing.remove(&id);
            debug!(client = %id, "removed");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Completes on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "installing SIGINT handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::consts::PROTOCOL;
    use crate::transport::Transport;
    use crate::websocket::Frame;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start(config: ServerConfig) -> (SocketAddr, JoinHandle<Result<()>>) {
        let server = Server::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..config
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run_until(std::future::pending()));
        (addr, handle)
    }

    /// Like [`start`], but hands the server back once `stop` fires so its
    /// bookkeeping can be inspected.
    async fn start_stoppable(
        config: ServerConfig,
    ) -> (
        SocketAddr,
        oneshot::Sender<()>,
        JoinHandle<(Server, Result<()>)>,
    ) {
        let mut server = Server::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..config
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let outcome = server
                .serve(async {
                    let _ = stopped.await;
                })
                .await;
            (server, outcome)
        });
        (addr, stop_tx, handle)
    }

    async fn stop(stop: oneshot::Sender<()>, handle: JoinHandle<(Server, Result<()>)>) -> Server {
        stop.send(()).unwrap();
        let (server, outcome) = time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_ok!(outcome);
        server
    }

    async fn connect(addr: SocketAddr) -> Connection<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::client(stream, vec![PROTOCOL.into()]);
        conn.start_handshake("127.0.0.1", addr.port(), "/")
            .await
            .unwrap();
        while conn.state() == State::Connecting {
            conn.readable().await.unwrap();
            conn.read(2048).await.unwrap();
        }
        assert_eq!(conn.state(), State::Open);
        assert_eq!(conn.protocol(), Some(PROTOCOL));
        conn
    }

    /// Next text message, or `None` once the connection is closed.
    async fn next_text(conn: &mut Connection<TcpStream>) -> Option<String> {
        next_text_within(conn, WAIT).await
    }

    async fn next_text_within(conn: &mut Connection<TcpStream>, limit: Duration) -> Option<String> {
        time::timeout(limit, async {
            loop {
                if let Some(text) = conn.take_text_messages().into_iter().next() {
                    return Some(text);
                }
                if conn.state() == State::Closed {
                    return None;
                }
                // A reset after the closing handshake also ends the session.
                if conn.readable().await.is_err() || conn.read(65536).await.is_err() {
                    return conn.take_text_messages().into_iter().next();
                }
            }
        })
        .await
        .unwrap()
    }

    async fn register(addr: SocketAddr) -> Connection<TcpStream> {
        let mut listener = connect(addr).await;
        listener.write_text(r#"{"action":"listen"}"#).await.unwrap();
        // No acknowledgement exists; give the relay a moment to register.
        time::sleep(Duration::from_millis(100)).await;
        listener
    }

    #[tokio::test]
    async fn relays_notification_and_closes_sender() {
        let (addr, handle) = start(ServerConfig::default()).await;
        let mut a = register(addr).await;
        let mut b = connect(addr).await;

        let message = r#"{"action":"ping","data":{"value":1}}"#;
        b.write_text(message).await.unwrap();

        assert_eq!(next_text(&mut a).await.as_deref(), Some(message));
        assert_eq!(next_text(&mut b).await, None);
        let reason = b.peer_close_reason().unwrap();
        assert_eq!(reason.code, Some(CLOSE_NORMAL));
        assert_eq!(reason.reason, "Received message.");
        assert_eq!(a.state(), State::Open);

        let mut c = connect(addr).await;
        c.write_text(r#"{"action":"refresh"}"#).await.unwrap();
        assert_eq!(
            next_text(&mut a).await.as_deref(),
            Some(r#"{"action":"refresh"}"#)
        );

        handle.abort();
    }

    #[tokio::test]
    async fn shutdown_action_stops_server() {
        let (addr, handle) = start(ServerConfig::default()).await;
        let mut listener = register(addr).await;
        let mut b = connect(addr).await;
        b.write_text(r#"{"action":"shutdown"}"#).await.unwrap();

        let outcome = time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert!(outcome.is_ok());

        assert_eq!(next_text(&mut listener).await, None);
        assert_eq!(
            listener.peer_close_reason().and_then(|r| r.code),
            Some(CLOSE_GOING_AWAY)
        );
        assert_eq!(next_text(&mut b).await, None);
        assert_eq!(b.peer_close_reason().and_then(|r| r.code), Some(CLOSE_NORMAL));

        // Listening socket released.
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn external_shutdown_closes_clients() {
        let server = Server::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        let mut listener = register(addr).await;
        tx.send(()).unwrap();
        assert!(time::timeout(WAIT, handle).await.unwrap().unwrap().is_ok());
        assert_eq!(next_text(&mut listener).await, None);
        let reason = listener.peer_close_reason().unwrap();
        assert_eq!(reason.code, Some(CLOSE_GOING_AWAY));
        assert_eq!(reason.reason, "Server shutting down.");
    }

    #[tokio::test]
    async fn malformed_json_closes_with_protocol_error() {
        let (addr, handle) = start(ServerConfig::default()).await;
        let mut listener = register(addr).await;
        let mut b = connect(addr).await;
        b.write_text("{not json").await.unwrap();

        assert_eq!(next_text(&mut b).await, None);
        assert_eq!(
            b.peer_close_reason().and_then(|r| r.code),
            Some(CLOSE_PROTOCOL_ERROR)
        );

        // The relay carries on.
        let mut c = connect(addr).await;
        c.write_text(r#"{"action":"after"}"#).await.unwrap();
        assert_eq!(
            next_text(&mut listener).await.as_deref(),
            Some(r#"{"action":"after"}"#)
        );
        handle.abort();
    }

    #[tokio::test]
    async fn binary_message_is_refused() {
        let (addr, handle) = start(ServerConfig::default()).await;
        let mut b = connect(addr).await;
        b.write_binary([1u8, 2, 3]).await.unwrap();
        assert_eq!(next_text(&mut b).await, None);
        assert_eq!(
            b.peer_close_reason().and_then(|r| r.code),
            Some(CLOSE_DATA_TYPE)
        );
        handle.abort();
    }

    #[tokio::test]
    async fn ping_flood_does_not_stall_relay() {
        let (addr, handle) = start(ServerConfig {
            write_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        })
        .await;
        let mut listener = register(addr).await;

        // A peer that floods pings and never reads the pongs.
        let mut rogue = connect(addr).await;
        let ping = Frame::ping(vec![0u8; 125]).masked().encode();
        let flood = ping.repeat(200_000);
        let flooding = tokio::spawn(async move {
            let _ = Transport::write_all(rogue.stream_mut(), &flood).await;
            rogue
        });
        time::sleep(Duration::from_secs(1)).await;

        let mut sender = time::timeout(WAIT, connect(addr))
            .await
            .expect("handshake stalled behind the flood");
        sender.write_text(r#"{"action":"after-flood"}"#).await.unwrap();
        assert_eq!(
            next_text(&mut listener).await.as_deref(),
            Some(r#"{"action":"after-flood"}"#)
        );

        handle.abort();
        flooding.abort();
    }

    #[tokio::test]
    async fn closing_connection_is_dropped_after_close_timeout() {
        for (close_timeout, remaining) in [
            (Duration::from_millis(200), 0),
            (Duration::from_secs(30), 1),
        ] {
            let (addr, stop_tx, handle) = start_stoppable(ServerConfig {
                close_timeout,
                ..ServerConfig::default()
            })
            .await;
            // Posts a notification, then neither reads nor answers the CLOSE.
            let mut silent = connect(addr).await;
            silent.write_text(r#"{"action":"quiet"}"#).await.unwrap();
            time::sleep(Duration::from_millis(600)).await;

            let server = stop(stop_tx, handle).await;
            assert_eq!(server.clients.len(), remaining, "{close_timeout:?}");
            assert_eq!(server.closing.len(), remaining, "{close_timeout:?}");
            assert_eq!(silent.state(), State::Open);
        }
    }

    #[tokio::test]
    async fn abrupt_listener_disconnect_is_removed() {
        let (addr, stop_tx, handle) = start_stoppable(ServerConfig::default()).await;
        let gone = register(addr).await;
        let _stays = register(addr).await;
        drop(gone);
        time::sleep(Duration::from_millis(200)).await;

        let server = stop(stop_tx, handle).await;
        assert_eq!(server.listen_clients.len(), 1);
        assert_eq!(server.clients.len(), 1);
    }

    #[tokio::test]
    async fn stalled_listener_does_not_block_others() {
        const LIMIT: usize = 64 << 20;

        let (addr, stop_tx, handle) = start_stoppable(ServerConfig {
            read_buffer_len: 256 << 10,
            write_timeout: Duration::from_secs(3),
            max_message_len: LIMIT,
            ..ServerConfig::default()
        })
        .await;
        let reader = register(addr).await.with_max_message_len(LIMIT);
        // Registered but never reads, so the relay write to it stalls.
        let mut stalled = register(addr).await;

        let reading = tokio::spawn(async move {
            let mut reader = reader;
            let big = next_text_within(&mut reader, WAIT * 3).await;
            (reader, big)
        });

        let big = format!(r#"{{"action":"bulk","data":"{}"}}"#, "x".repeat(24 << 20));
        let expected_len = big.len();
        let mut sender = connect(addr).await;
        tokio::spawn(async move { sender.write_text(&big).await });

        let (mut reader, big) = time::timeout(WAIT * 3, reading).await.unwrap().unwrap();
        assert_eq!(big.map(|text| text.len()), Some(expected_len));

        let mut second = connect(addr).await;
        second.write_text(r#"{"action":"small"}"#).await.unwrap();
        assert_eq!(
            next_text(&mut reader).await.as_deref(),
            Some(r#"{"action":"small"}"#)
        );

        let server = stop(stop_tx, handle).await;
        assert_eq!(server.listen_clients.len(), 1);
        assert_eq!(next_text(&mut stalled).await, None);
    }

    #[tokio::test]
    async fn bad_handshake_gets_http_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (addr, handle) = start(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        AsyncWriteExt::write_all(
            &mut stream,
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();
        let mut response = String::new();
        time::timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("X-WebSocket-Message: "));
        handle.abort();
    }
}
