//! Typed event streams emitted by the blob engine
//!
//! Ingestion and download are long-running engine operations that report
//! back through a bounded channel. Each stream ends with exactly one
//! terminal event (`AllComplete`/`AllDone` or `Abort`); consumers stop
//! reading as soon as they see it.

use cid::Cid;
use tokio::sync::mpsc;

use crate::ticket::BlobFormat;

/// Receiving end of an engine event stream
pub type EventStream<T> = mpsc::Receiver<T>;

/// Sending end of an engine event stream
pub type EventSink<T> = mpsc::Sender<T>;

/// Capacity of engine event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Create a connected event sink and stream
pub fn event_channel<T>() -> (EventSink<T>, EventStream<T>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Progress of an ingestion started with `BlobEngine::ingest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionEvent {
    /// A file was found and is about to be hashed
    Found { name: String, size: u64 },
    /// Bytes of a file hashed so far
    Progress { name: String, offset: u64 },
    /// One constituent blob finished hashing and storing
    UnitComplete { name: String, hash: Cid },
    /// Ingestion finished; `hash` is the root of the whole object
    AllComplete {
        hash: Cid,
        format: BlobFormat,
        tag: String,
    },
    /// Ingestion failed
    Abort { reason: String },
}

/// Progress of a download started with `BlobEngine::download`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// The total size of the content became known
    Found { total_size: u64 },
    /// Bytes received so far; non-decreasing
    Progress { offset: u64 },
    /// All content is stored locally
    AllDone { bytes_written: u64 },
    /// The download failed
    Abort { reason: String },
}
