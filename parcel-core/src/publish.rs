//! Publish pipeline
//!
//! Turns a local file or directory into a [`BlobTicket`]. Directories (or
//! files, when asked) are streamed through [`BlobEngine::ingest`] and the
//! resulting events are folded into a per-call [`IngestionSession`]; files
//! can instead be read whole and added in one shot.

use cid::Cid;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::{BlobEngine, SetTagOption, WrapOption};
use crate::error::{ParcelError, Result};
use crate::events::{EventStream, IngestionEvent};
use crate::ticket::{AddrInfoOptions, BlobFormat, BlobTicket};

/// How content reaches the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishMode {
    /// Stream directories, add files in one shot
    #[default]
    Auto,
    /// Always stream through ingestion events
    Stream,
    /// Read a single file into memory and add it in one shot
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub mode: PublishMode,
    /// Reference source files in place instead of copying them into the store
    pub in_place: bool,
    /// Wrap streamed content in a collection named after the input
    pub wrap: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            mode: PublishMode::Auto,
            in_place: true,
            wrap: true,
        }
    }
}

/// Outcome of a successful publish
#[derive(Debug, Clone)]
pub struct Published {
    pub ticket: BlobTicket,
    pub hash: Cid,
    pub format: BlobFormat,
    /// Tag protecting the root
    pub tag: String,
    /// Every constituent blob, by name, in completion order
    pub blobs: Vec<(String, Cid)>,
}

/// State of one ingestion, owned by one publish call
#[derive(Debug, Default)]
pub struct IngestionSession {
    root: Option<(Cid, BlobFormat, String)>,
    units: Vec<(String, Cid)>,
}

impl IngestionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in; returns `true` once the terminal success event arrived
    pub fn apply(&mut self, event: IngestionEvent) -> Result<bool> {
        match event {
            IngestionEvent::Found { name, size } => {
                debug!(%name, size, "Found");
                Ok(false)
            }
            IngestionEvent::Progress { name, offset } => {
                debug!(%name, offset, "Hashing");
                Ok(false)
            }
            IngestionEvent::UnitComplete { name, hash } => {
                debug!(%name, %hash, "Stored");
                self.units.push((name, hash));
                Ok(false)
            }
            IngestionEvent::AllComplete { hash, format, tag } => {
                self.root = Some((hash, format, tag));
                Ok(true)
            }
            IngestionEvent::Abort { reason } => Err(ParcelError::IngestionFailed(reason)),
        }
    }

    /// Drain a stream until its terminal event
    pub async fn consume(&mut self, mut events: EventStream<IngestionEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            if self.apply(event)? {
                return Ok(());
            }
        }
        Err(ParcelError::IngestionFailed(
            "Event stream ended before ingestion completed".to_string(),
        ))
    }

    pub fn root(&self) -> Option<(Cid, BlobFormat)> {
        self.root.as_ref().map(|(hash, format, _)| (*hash, *format))
    }

    pub fn units(&self) -> &[(String, Cid)] {
        &self.units
    }
}

/// Publish `path` and issue a ticket for it
pub async fn publish<E>(engine: &E, path: &Path, options: &PublishOptions) -> Result<Published>
where
    E: BlobEngine + ?Sized,
{
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ParcelError::IngestionFailed(format!("{}: {}", path.display(), e)))?;

    let stream = match options.mode {
        PublishMode::Auto => metadata.is_dir(),
        PublishMode::Stream => true,
        PublishMode::InMemory if metadata.is_dir() => {
            return Err(ParcelError::IngestionFailed(format!(
                "{} is a directory; in-memory publishing takes a single file",
                path.display()
            )))
        }
        PublishMode::InMemory => false,
    };

    let (hash, format, tag, blobs) = if stream {
        let wrap = if options.wrap {
            WrapOption::Wrap { name: None }
        } else {
            WrapOption::NoWrap
        };
        let events = engine
            .ingest(path, options.in_place, SetTagOption::Auto, wrap)
            .await?;

        let mut session = IngestionSession::new();
        session.consume(events).await?;
        let IngestionSession { root, units, .. } = session;
        let (hash, format, tag) = root.ok_or_else(|| {
            ParcelError::IngestionFailed("Ingestion completed without a root".to_string())
        })?;
        (hash, format, tag, units)
    } else {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| ParcelError::IngestionFailed(format!("{}: {}", path.display(), e)))?;

        let outcome = engine.add_named_bytes(content, &name).await?;
        (
            outcome.hash,
            outcome.format,
            outcome.tag,
            vec![(name, outcome.hash)],
        )
    };

    let ticket = engine
        .issue_ticket(hash, format, AddrInfoOptions::RelayAndAddresses)
        .await?;

    if let Ok(stored) = engine.list_blobs().await {
        debug!("Engine holds {} objects after publish", stored.len());
    }
    info!("Published {:?} as {} {} ({} blobs)", path, format, hash, blobs.len());

    Ok(Published {
        ticket,
        hash,
        format,
        tag,
        blobs,
    })
}
