//! Share and receive orchestration for the binary
//!
//! `share` publishes, prints the ticket and keeps the node serving until a
//! [`ShutdownHandle`] fires (Ctrl+C in the binary). `receive` parses the
//! ticket, fetches with a terminal progress bar and exits.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Command, Config, NodeConfig};
use crate::error::Result;
use crate::node::Node;
use crate::progress::{human_size, ProgressState, ProgressTracker};
use crate::publish::{publish, PublishOptions, Published};
use crate::retrieve::{retrieve_ticket, ProgressObserver, RetrieveOptions, Retrieved};
use crate::ticket::BlobTicket;

/// Run the command the process was started with
pub async fn run(config: Config) -> Result<()> {
    match config.command {
        Command::Share { path, options } => share(&config.node, &path, &options).await,
        Command::Receive {
            ticket,
            destination,
            options,
        } => receive(&config.node, &ticket, &destination, &options)
            .await
            .map(|_| ()),
    }
}

/// Publish `path` and serve it until Ctrl+C
pub async fn share(node_config: &NodeConfig, path: &Path, options: &PublishOptions) -> Result<()> {
    let node = Node::start(node_config).await?;

    let published = match publish(node.engine(), path, options).await {
        Ok(published) => published,
        Err(e) => {
            node.shutdown().await;
            return Err(e);
        }
    };

    let stats = node.engine().store().stats().await;
    info!(
        blocks = stats.block_count,
        bytes = stats.total_size,
        references = stats.reference_count,
        "Serving {}",
        published.hash
    );

    println!("{}", published.ticket);
    eprintln!(
        "Sharing {} ({}, {} blobs). Press Ctrl+C to stop.",
        path.display(),
        published.format,
        published.blobs.len()
    );

    let session = ShareSession::new(published);
    let handle = session.shutdown_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping share");
                handle.shutdown();
            }
            Err(e) => warn!("Cannot listen for Ctrl+C: {}", e),
        }
    });

    session.wait().await;
    node.shutdown().await;
    Ok(())
}

/// Fetch the content behind `ticket` into `destination`
///
/// The ticket is parsed before the node starts, so a malformed one never
/// touches the network.
pub async fn receive(
    node_config: &NodeConfig,
    ticket: &str,
    destination: &Path,
    options: &RetrieveOptions,
) -> Result<Retrieved> {
    let ticket: BlobTicket = ticket.trim().parse()?;
    let node = Node::start(node_config).await?;

    let mut observer = TerminalProgress::new();
    let result = retrieve_ticket(node.engine(), &ticket, destination, options, &mut observer).await;
    node.shutdown().await;

    let retrieved = result?;
    eprintln!(
        "Received {} into {}",
        human_size(retrieved.bytes_written),
        retrieved.destination.display()
    );
    Ok(retrieved)
}

/// Keeps published content available until shut down
pub struct ShareSession {
    published: Published,
    shutdown: Arc<watch::Sender<bool>>,
    signal: watch::Receiver<bool>,
}

impl ShareSession {
    pub fn new(published: Published) -> Self {
        let (shutdown, signal) = watch::channel(false);
        Self {
            published,
            shutdown: Arc::new(shutdown),
            signal,
        }
    }

    pub fn published(&self) -> &Published {
        &self.published
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Wait until a [`ShutdownHandle`] fires
    pub async fn wait(mut self) -> Published {
        // The session holds a sender itself, so the channel never closes under us
        let _ = self.signal.wait_for(|stopped| *stopped).await;
        info!("Stopped sharing {}", self.published.hash);
        self.published
    }
}

/// Ends a [`ShareSession`]
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Progress bar on stderr
struct TerminalProgress {
    last: Option<ProgressState>,
}

impl TerminalProgress {
    fn new() -> Self {
        Self { last: None }
    }
}

impl ProgressObserver for TerminalProgress {
    fn on_progress(&mut self, state: ProgressState, tracker: &ProgressTracker) {
        if self.last == Some(state) {
            return;
        }
        self.last = Some(state);

        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{} {}", state.render(), tracker);
        let _ = stderr.flush();
    }

    fn on_complete(&mut self, tracker: &ProgressTracker) {
        eprintln!("\nDone: {}", tracker.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParcelError;
    use crate::testing::ScriptedEngine;
    use crate::ticket::{BlobFormat, NodeAddr};
    use libp2p::PeerId;
    use std::time::Duration;

    fn published() -> Published {
        let hash = ScriptedEngine::blob_hash(1);
        Published {
            ticket: BlobTicket::new(NodeAddr::new(PeerId::random()), hash, BlobFormat::Raw)
                .unwrap(),
            hash,
            format: BlobFormat::Raw,
            tag: "t".into(),
            blobs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_share_session_waits_for_shutdown() {
        let session = ShareSession::new(published());
        let handle = session.shutdown_handle();
        let waiter = tokio::spawn(session.wait());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        handle.shutdown();
        let done = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.hash, ScriptedEngine::blob_hash(1));
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_before_wait() {
        let session = ShareSession::new(published());
        session.shutdown_handle().shutdown();
        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_ticket_before_start() {
        // A data dir that cannot be created would fail node start
        let config = NodeConfig {
            persistent: true,
            data_dir: "/dev/null/parcel".into(),
            ..NodeConfig::default()
        };
        let result = receive(
            &config,
            "garbage",
            Path::new("/tmp/unused"),
            &RetrieveOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(ParcelError::InvalidTicket(_))));
    }
}
