//! Parcel - peer-to-peer file sharing with self-contained tickets
//!
//! `parcel share <PATH>` prints a ticket; `parcel receive <TICKET> <DEST>`
//! fetches the content behind it.

use parcel_core::{run, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    run(config).await?;

    Ok(())
}

/// Logs go to stderr; stdout carries the ticket
fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
