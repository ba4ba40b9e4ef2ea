//! Retrieval pipeline
//!
//! Parses a ticket, drives [`BlobEngine::download`] while folding events
//! into a per-call [`TransferSession`], then materializes the content
//! either by reading it back as bytes or by exporting it as a tree.

use cid::Cid;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::engine::{BlobEngine, ExportFormat, ExportMode};
use crate::error::{ParcelError, Result};
use crate::events::{DownloadEvent, EventStream};
use crate::progress::{ProgressState, ProgressTracker};
use crate::ticket::{BlobFormat, BlobTicket};

/// How downloaded content is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaterializeMode {
    /// Bytes for raw blobs, export for collections
    #[default]
    Auto,
    /// Read the root back and write it as one file
    Bytes,
    /// Export through the engine
    Export,
}

/// Strategy actually used for one retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialization {
    Bytes,
    Export,
}

impl MaterializeMode {
    pub fn resolve(self, format: BlobFormat) -> Materialization {
        match (self, format) {
            (MaterializeMode::Bytes, _) | (MaterializeMode::Auto, BlobFormat::Raw) => {
                Materialization::Bytes
            }
            (MaterializeMode::Export, _) | (MaterializeMode::Auto, BlobFormat::Collection) => {
                Materialization::Export
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetrieveOptions {
    pub materialize: MaterializeMode,
    pub export_mode: ExportMode,
}

/// Receives progress updates during a transfer
pub trait ProgressObserver: Send {
    fn on_progress(&mut self, state: ProgressState, tracker: &ProgressTracker);

    fn on_complete(&mut self, _tracker: &ProgressTracker) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&mut self, _state: ProgressState, _tracker: &ProgressTracker) {}
}

/// Outcome of a successful retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub hash: Cid,
    pub format: BlobFormat,
    pub destination: PathBuf,
    pub bytes_written: u64,
    pub materialization: Materialization,
}

/// State of one download, owned by one retrieval call
#[derive(Debug, Default)]
pub struct TransferSession {
    tracker: ProgressTracker,
    bytes_written: Option<u64>,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in; returns `true` once the terminal success event arrived
    pub fn apply(
        &mut self,
        event: DownloadEvent,
        observer: &mut dyn ProgressObserver,
    ) -> Result<bool> {
        if let Some(state) = self.tracker.observe(&event) {
            observer.on_progress(state, &self.tracker);
        }

        match event {
            DownloadEvent::Found { total_size } => {
                debug!(total_size, "Transfer size known");
                Ok(false)
            }
            DownloadEvent::Progress { .. } => Ok(false),
            DownloadEvent::AllDone { bytes_written } => {
                self.bytes_written = Some(bytes_written);
                observer.on_complete(&self.tracker);
                Ok(true)
            }
            DownloadEvent::Abort { reason } => Err(ParcelError::TransferFailed(reason)),
        }
    }

    /// Drain a stream until its terminal event
    pub async fn consume(
        &mut self,
        mut events: EventStream<DownloadEvent>,
        observer: &mut dyn ProgressObserver,
    ) -> Result<u64> {
        while let Some(event) = events.recv().await {
            if self.apply(event, observer)? {
                return Ok(self.bytes_written.unwrap_or_default());
            }
        }
        Err(ParcelError::TransferFailed(
            "Event stream ended before transfer completed".to_string(),
        ))
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }
}

/// Parse `ticket` and fetch its content to `destination`
///
/// A malformed ticket fails before the engine is touched.
pub async fn retrieve<E>(
    engine: &E,
    ticket: &str,
    destination: &Path,
    options: &RetrieveOptions,
    observer: &mut dyn ProgressObserver,
) -> Result<Retrieved>
where
    E: BlobEngine + ?Sized,
{
    let ticket: BlobTicket = ticket.trim().parse()?;
    retrieve_ticket(engine, &ticket, destination, options, observer).await
}

/// Fetch the content of an already parsed ticket to `destination`
pub async fn retrieve_ticket<E>(
    engine: &E,
    ticket: &BlobTicket,
    destination: &Path,
    options: &RetrieveOptions,
    observer: &mut dyn ProgressObserver,
) -> Result<Retrieved>
where
    E: BlobEngine + ?Sized,
{
    let hash = ticket.hash();
    let format = ticket.format();
    info!(
        "Fetching {} {} from {}",
        format,
        hash,
        ticket.node_addr().peer_id
    );

    let events = engine.download(hash, ticket.as_download_options()).await?;
    let mut session = TransferSession::new();
    let bytes_written = session.consume(events, observer).await?;

    let materialization = options.materialize.resolve(format);
    materialize(engine, hash, format, destination, materialization, options.export_mode)
        .await
        .map_err(|reason| ParcelError::MaterializationFailed {
            path: destination.to_path_buf(),
            reason,
        })?;

    info!(
        "Materialized {} at {:?} ({:?}, {})",
        hash,
        destination,
        materialization,
        session.tracker().summary()
    );

    Ok(Retrieved {
        hash,
        format,
        destination: destination.to_path_buf(),
        bytes_written,
        materialization,
    })
}

async fn materialize<E>(
    engine: &E,
    hash: Cid,
    format: BlobFormat,
    destination: &Path,
    materialization: Materialization,
    export_mode: ExportMode,
) -> std::result::Result<(), String>
where
    E: BlobEngine + ?Sized,
{
    match materialization {
        Materialization::Bytes => {
            let data = engine.read_bytes(&hash).await.map_err(|e| e.to_string())?;
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            tokio::fs::write(destination, &data)
                .await
                .map_err(|e| e.to_string())
        }
        Materialization::Export => {
            let export_format = match format {
                BlobFormat::Raw => ExportFormat::Blob,
                BlobFormat::Collection => ExportFormat::Collection,
            };
            engine
                .export(&hash, destination, export_format, export_mode)
                .await
                .map_err(|e| e.to_string())
        }
    }
}
