//! Parcel Core
//!
//! Content-addressed publishing and ticket-based retrieval over libp2p.

pub mod blobs;
pub mod chunker;
pub mod cid_blake3;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod manifest;
pub mod node;
pub mod p2p;
pub mod progress;
pub mod publish;
pub mod retrieve;
pub mod runtime;
pub mod storage;
pub mod ticket;

#[cfg(test)]
mod testing;

pub use blobs::Blobs;
pub use chunker::{Chunk, Chunker, DEFAULT_CHUNK_SIZE};
pub use cid_blake3::{blake3_cid, blake3_hash, verify_blake3, CidError};
pub use config::{Command, Config, ConfigError, NodeConfig};
pub use engine::{
    BlobAddOutcome, BlobEngine, EngineError, ExportFormat, ExportMode, SetTagOption, WrapOption,
};
pub use error::ParcelError;
pub use events::{DownloadEvent, EventStream, IngestionEvent};
pub use manifest::{BlobManifest, Collection, CollectionEntry, ManifestError};
pub use node::Node;
pub use p2p::{NetworkConfig, NetworkHandle, P2PError};
pub use progress::{human_size, ProgressState, ProgressTracker};
pub use publish::{publish, IngestionSession, PublishMode, PublishOptions, Published};
pub use retrieve::{
    retrieve, retrieve_ticket, MaterializeMode, Materialization, NoProgress, ProgressObserver,
    RetrieveOptions, Retrieved, TransferSession,
};
pub use runtime::{run, ShareSession, ShutdownHandle};
pub use storage::{Block, BlockStore, BlockStoreStats, StorageError, StoreBacking};
pub use ticket::{AddrInfoOptions, BlobFormat, BlobTicket, DownloadOptions, NodeAddr, TicketError};

// Re-export Cid and libp2p addressing types for external use
pub use cid::Cid;
pub use libp2p::{Multiaddr, PeerId};
