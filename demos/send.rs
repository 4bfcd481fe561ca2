//! Post one notification to a relay.
//!
//! Run with: `cargo run --example send -- ws://localhost:3000/ ping '{"value":1}'`

use anyhow::Context;
use ws_notifier::Sender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let mut args = std::env::args().skip(1);
    let url = args.next().context("usage: send <ws-url> <action> [json-data]")?;
    let action = args.next().context("missing action")?;
    let data = args
        .next()
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("data is not valid JSON")?;

    Sender::new(&url)?.send(&action, data).await?;
    println!("Sent '{action}' to {url}");
    Ok(())
}
