//! The blob engine capability contract
//!
//! Publish and retrieval pipelines only ever talk to storage and the
//! network through [`BlobEngine`]. [`crate::blobs::Blobs`] is the engine a
//! running node uses; tests substitute scripted engines.

use async_trait::async_trait;
use cid::Cid;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cid_blake3::CidError;
use crate::events::{DownloadEvent, EventStream, IngestionEvent};
use crate::manifest::ManifestError;
use crate::p2p::P2PError;
use crate::storage::StorageError;
use crate::ticket::{AddrInfoOptions, BlobFormat, BlobTicket, DownloadOptions, TicketError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Hash error: {0}")]
    Hash(#[from] CidError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Network error: {0}")]
    Network(#[from] P2PError),

    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),

    #[error("Content not found: {0}")]
    NotFound(Cid),

    #[error("Unsupported object codec 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("Path does not exist: {0}")]
    MissingPath(PathBuf),

    #[error("Export destination conflict: {0}")]
    Conflict(PathBuf),

    #[error("Engine is offline")]
    Offline,

    #[error("Chunk size must be non-zero")]
    InvalidChunkSize,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether ingestion pins the result under a tag
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SetTagOption {
    /// Create a fresh tag
    #[default]
    Auto,
    /// Set a tag with the given name
    Named(String),
}

/// Whether ingestion wraps its input in a collection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WrapOption {
    /// Files become raw blobs, directories collections of their contents
    #[default]
    NoWrap,
    /// Wrap the input in a collection, prefixing every entry with `name/`
    Wrap { name: Option<String> },
}

impl WrapOption {
    pub fn wrap(name: impl Into<String>) -> Self {
        WrapOption::Wrap {
            name: Some(name.into()),
        }
    }
}

/// How exported content is laid down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// Write one blob to one file
    Blob,
    /// Recreate every entry of a collection below a directory
    #[default]
    Collection,
}

/// How exported bytes reach the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportMode {
    /// Always write a fresh copy
    #[default]
    Copy,
    /// Hard-link from an in-place source when one exists, copy otherwise
    TryReference,
}

/// Result of a one-shot add
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAddOutcome {
    pub hash: Cid,
    pub format: BlobFormat,
    pub size: u64,
    pub tag: String,
}

/// Content-addressed storage plus peer transport
#[async_trait]
pub trait BlobEngine: Send + Sync {
    /// Hash and store a file or directory, reporting through an event stream
    async fn ingest(
        &self,
        path: &Path,
        in_place: bool,
        tag: SetTagOption,
        wrap: WrapOption,
    ) -> Result<EventStream<IngestionEvent>, EngineError>;

    /// Store bytes as a single raw blob tagged with `name`
    async fn add_named_bytes(&self, content: Vec<u8>, name: &str)
        -> Result<BlobAddOutcome, EngineError>;

    /// Create a ticket for content held by this node
    async fn issue_ticket(
        &self,
        hash: Cid,
        format: BlobFormat,
        addr_options: AddrInfoOptions,
    ) -> Result<BlobTicket, EngineError>;

    /// Fetch content and everything it references, reporting through an event stream
    async fn download(
        &self,
        hash: Cid,
        options: DownloadOptions,
    ) -> Result<EventStream<DownloadEvent>, EngineError>;

    /// Read a locally available object back as one byte buffer
    async fn read_bytes(&self, hash: &Cid) -> Result<Vec<u8>, EngineError>;

    /// Write a locally available object to the filesystem
    async fn export(
        &self,
        hash: &Cid,
        destination: &Path,
        format: ExportFormat,
        mode: ExportMode,
    ) -> Result<(), EngineError>;

    /// Every object held by this engine; diagnostic only
    async fn list_blobs(&self) -> Result<Vec<Cid>, EngineError>;
}
