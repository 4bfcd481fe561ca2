//! Run the relay until Ctrl-C, SIGTERM or a `shutdown` action.
//!
//! Run with: `cargo run --example relay_server -- [port] [verbosity 0-4]`

use tracing_subscriber::EnvFilter;
use ws_notifier::{Server, ServerConfig, Verbosity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => 3000,
    };
    let verbosity = match args.next() {
        Some(level) => Verbosity::from(level.parse::<u8>()?),
        None => Verbosity::Messages,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from(verbosity).into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = Server::bind(ServerConfig::with_port(port)).await?;
    println!("Relay listening on {}", server.local_addr()?);
    server.run().await?;
    Ok(())
}
