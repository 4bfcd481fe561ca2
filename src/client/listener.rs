//! Long-lived notification listener.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{connect, disconnect, WsUrl};
use crate::config::ClientConfig;
use crate::events::{Event, Notification};
use crate::server::RelayMessage;
use crate::websocket::consts::CLOSE_GOING_AWAY;
use crate::websocket::{Connection, State};
use crate::Result;

/// Type alias for event handlers so the listener field stays readable and Send + Sync.
type EventHandler = Box<dyn Fn(Event) + Send + Sync>;

/// Subscribes to a relay and hands every notification to registered handlers.
pub struct Listener {
    url: WsUrl,
    config: ClientConfig,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    connected: AtomicBool,
}

impl Listener {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self> {
        Ok(Self {
            url: WsUrl::parse(url)?,
            config,
            handlers: Arc::new(RwLock::new(Vec::new())),
            connected: AtomicBool::new(false),
        })
    }

    /// Add an event handler (called for every event).
    pub async fn add_event_handler<F>(&self, f: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.handlers.write().await.push(Box::new(f));
    }

    /// Whether a subscribed session is currently running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Listen until the server ends the session.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Listen until the server ends the session or `stop` completes, in
    /// which case the listener closes with going-away.
    ///
    /// Emits [`Event::Connected`] once subscribed and [`Event::Disconnected`]
    /// when the session ends, whatever the cause.
    pub async fn run_until<F>(&self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut conn = connect(&self.url, &self.config).await?;
        if let Err(e) = conn.write_text(RelayMessage::Listen.to_json()).await {
            conn.close().await;
            return Err(e);
        }
        debug!(url = %self.url, "listening");
        self.connected.store(true, Ordering::SeqCst);
        self.dispatch_event(Event::Connected).await;

        let stopped = tokio::select! {
            outcome = self.receive(&mut conn) => outcome.map(|()| false),
            _ = stop => Ok(true),
        };
        let outcome = match stopped {
            Ok(true) => {
                disconnect(&mut conn, CLOSE_GOING_AWAY, "Listener stopped.", &self.config).await
            }
            other => other.map(|_| ()),
        };
        conn.close().await;
        self.connected.store(false, Ordering::SeqCst);

        let reason = match (&outcome, conn.peer_close_reason()) {
            (Err(e), _) => e.to_string(),
            (Ok(()), Some(close)) => match close.code {
                Some(code) if close.reason.is_empty() => format!("closed with {code}"),
                Some(code) => format!("closed with {code}: {}", close.reason),
                None => "closed".to_string(),
            },
            (Ok(()), None) => "connection closed".to_string(),
        };
        debug!(url = %self.url, %reason, "disconnected");
        self.dispatch_event(Event::Disconnected { reason }).await;
        outcome
    }

    async fn receive(&self, conn: &mut Connection<TcpStream>) -> Result<()> {
        while conn.state() != State::Closed {
            let read = match conn.readable().await {
                Ok(()) => conn.read(self.config.read_buffer_len).await,
                Err(e) => Err(e),
            };
            if let Err(e) = read {
                if conn.state() >= State::Closing {
                    debug!(error = %e, "read failed while closing");
                    conn.close().await;
                    break;
                }
                warn!(error = %e, "failing connection");
                if let Err(close) = conn.start_close(e.close_code(), &e.to_string()).await {
                    debug!(error = %close, "close frame not sent");
                }
                return Err(e);
            }

            for raw in conn.take_text_messages() {
                match Notification::parse(raw) {
                    Some(notification) => {
                        debug!(action = %notification.action, "notification");
                        self.dispatch_event(Event::Notification(notification)).await;
                    }
                    None => warn!("ignoring message that is not a notification"),
                }
            }
            let binaries = conn.take_binary_messages();
            if !binaries.is_empty() {
                warn!(count = binaries.len(), "ignoring binary messages");
            }
        }
        Ok(())
    }

    async fn dispatch_event(&self, evt: Event) {
        let handlers = self.handlers.read().await;
        for f in handlers.iter() {
            f(evt.clone());
        }
    }
}
