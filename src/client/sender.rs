//! One-shot notification sender.

use serde_json::Value;
use tracing::debug;

use super::{connect, disconnect, WsUrl};
use crate::config::ClientConfig;
use crate::server::RelayMessage;
use crate::websocket::consts::CLOSE_GOING_AWAY;
use crate::Result;

/// Posts a single notification per connection, then disconnects.
#[derive(Debug, Clone)]
pub struct Sender {
    url: WsUrl,
    config: ClientConfig,
}

impl Sender {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self> {
        Ok(Self {
            url: WsUrl::parse(url)?,
            config,
        })
    }

    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    /// Send `{"action": action, "data": data}`. Empty or null `data` is left out.
    ///
    /// The server sends no acknowledgement; success means the message was
    /// written. A failed closing handshake afterwards is only logged.
    pub async fn send(&self, action: &str, data: Option<Value>) -> Result<()> {
        let message = RelayMessage::Notify {
            action: action.to_string(),
            data,
        }
        .to_json();

        let mut conn = connect(&self.url, &self.config).await?;
        if let Err(e) = conn.write_text(&message).await {
            conn.close().await;
            return Err(e);
        }
        debug!(url = %self.url, %message, "sent");
        if let Err(e) =
            disconnect(&mut conn, CLOSE_GOING_AWAY, "Client sent message.", &self.config).await
        {
            debug!(url = %self.url, error = %e, "close after send failed");
        }
        Ok(())
    }
}
