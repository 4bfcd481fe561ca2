//! Print every notification a relay forwards, until Ctrl-C or the relay stops.
//!
//! Run with: `cargo run --example listen -- ws://localhost:3000/`

use ws_notifier::{Event, Listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:3000/".to_string());
    let listener = Listener::new(&url)?;

    listener
        .add_event_handler(|evt| match evt {
            Event::Connected => println!("[Event] Listening."),
            Event::Notification(n) => println!("[Event] {}: {}", n.action, n.raw),
            Event::Disconnected { reason } => println!("[Event] Disconnected: {reason}"),
        })
        .await;

    listener
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
