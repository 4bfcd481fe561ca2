//! # ws-notifier
//!
//! WebSocket (RFC 6455) notification relay: one-shot senders post JSON
//! notifications, long-lived listeners receive every one of them.
//!
//! ## Features
//!
//! - Frame encoding and resumable parsing with 16/64-bit lengths and masking
//! - Opening handshake for both roles, sub-protocol negotiation
//! - Fragmented message reassembly, ping/pong, closing handshake
//! - Single-task relay server with listen/shutdown actions
//! - Sender and listener clients with timeouts
//!
//! ## Example
//!
//! ```ignore
//! use ws_notifier::{Listener, Sender, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(ServerConfig::with_port(3000)).await?;
//!     tokio::spawn(server.run());
//!
//!     let listener = Listener::new("ws://127.0.0.1:3000/")?;
//!     listener.add_event_handler(|evt| println!("{evt:?}")).await;
//!     tokio::spawn(async move { listener.run().await });
//!
//!     Sender::new("ws://127.0.0.1:3000/")?
//!         .send("ping", Some(serde_json::json!({"value": 1})))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod server;
pub mod transport;
pub mod websocket;

pub use client::{Listener, Sender, WsUrl};
pub use config::{ClientConfig, ServerConfig, Verbosity};
pub use error::{Error, Result};
pub use events::{Event, Notification};
pub use server::{shutdown_signal, RelayMessage, Server};
pub use transport::Transport;
pub use websocket::{Connection, State};
