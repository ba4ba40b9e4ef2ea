//! Content-addressed block storage
//!
//! Provides CID-indexed block storage with BLAKE3 verification. Two
//! backings exist: an in-memory map for ephemeral nodes, and RocksDB for
//! durable nodes. The backing is picked when the store is opened and never
//! changes afterwards.
//!
//! Besides owned blocks the store can hold *references*: a CID that maps
//! to a slice of a local file. In-place ingestion uses them to avoid
//! copying source bytes. A referenced block is re-verified on every read,
//! so a source file that changed after ingestion surfaces as a
//! verification error rather than corrupt content.

use bytes::Bytes;
use cid::Cid;
use rocksdb::{Options, DB};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::cid_blake3::{blake3_cid, verify_blake3, CidError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] CidError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a raw content block, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, CidError> {
        let cid = blake3_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        verify_blake3(&data, &cid)?;
        Ok(Self { cid, data })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A slice of a local file standing in for a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

/// Where a store keeps its blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBacking {
    /// Process memory; everything is gone when the node stops
    Memory,
    /// RocksDB database at the given directory
    Durable(PathBuf),
}

enum Backend {
    Memory(RwLock<HashMap<Cid, Bytes>>),
    Rocks(Arc<DB>),
}

/// CID-indexed block storage
pub struct BlockStore {
    backend: Backend,
    /// In-place references into source files
    references: RwLock<HashMap<Cid, FileSlice>>,
    /// Source file of each blob ingested in place
    sources: RwLock<HashMap<Cid, PathBuf>>,
    /// Named roots
    tags: RwLock<BTreeMap<String, Cid>>,
}

impl BlockStore {
    /// Open a store with the given backing
    pub fn open(backing: &StoreBacking) -> Result<Self, StorageError> {
        match backing {
            StoreBacking::Memory => Ok(Self::memory()),
            StoreBacking::Durable(path) => Self::durable(path),
        }
    }

    /// Create an in-memory store
    pub fn memory() -> Self {
        debug!("Opened in-memory block store");
        Self::with_backend(Backend::Memory(RwLock::new(HashMap::new())))
    }

    /// Create a store with a persistent RocksDB backend
    pub fn durable<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path.as_ref())?;

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Point lookups by CID dominate
        opts.optimize_for_point_lookup(64);
        opts.set_enable_pipelined_write(true);

        // Content blocks are frequently already compressed
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_target_file_size_base(128 * 1024 * 1024);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened RocksDB block store at {:?}", path.as_ref());
        Ok(Self::with_backend(Backend::Rocks(Arc::new(db))))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            references: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            tags: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Rocks(_))
    }

    /// Store a block, verifying its CID. Storing an existing block is a no-op.
    pub async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_blake3(&block.data, &block.cid)?;

        let cid = block.cid;
        let size = block.data.len();

        match &self.backend {
            Backend::Memory(blocks) => {
                blocks
                    .write()
                    .await
                    .entry(cid)
                    .or_insert_with(|| Bytes::from(block.data));
            }
            Backend::Rocks(db) => {
                let db = Arc::clone(db);
                let key = cid.to_bytes();
                let value = block.data;

                tokio::task::spawn_blocking(move || {
                    if db.get_pinned(&key)?.is_some() {
                        return Ok::<(), StorageError>(());
                    }
                    db.put(&key, &value)?;
                    Ok(())
                })
                .await
                .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??;
            }
        }

        trace!("Stored block {}, size: {} bytes", cid, size);
        Ok(())
    }

    /// Store raw data as a content block, returning its CID
    pub async fn put_data(&self, data: Vec<u8>) -> Result<Cid, StorageError> {
        let block = Block::new(data)?;
        let cid = block.cid;
        self.put(block).await?;
        Ok(cid)
    }

    /// Record that `cid` is served from a slice of a local file
    pub async fn put_reference(&self, cid: Cid, slice: FileSlice) {
        trace!(
            "Referenced block {} at {:?}[{}..{}]",
            cid,
            slice.path,
            slice.offset,
            slice.offset + slice.len
        );
        self.references.write().await.insert(cid, slice);
    }

    /// Remember the source file of a blob ingested in place
    pub async fn set_source(&self, blob: Cid, path: PathBuf) {
        self.sources.write().await.insert(blob, path);
    }

    /// Source file of a blob ingested in place, if any
    pub async fn source(&self, blob: &Cid) -> Option<PathBuf> {
        self.sources.read().await.get(blob).cloned()
    }

    /// Retrieve a block by CID
    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        if let Some(data) = self.get_owned(cid).await? {
            return Ok(Block { cid: *cid, data });
        }

        let slice = self.references.read().await.get(cid).cloned();
        match slice {
            Some(slice) => {
                let data = read_slice(&slice).await?;
                verify_blake3(&data, cid)?;
                Ok(Block { cid: *cid, data })
            }
            None => Err(StorageError::BlockNotFound(cid.to_string())),
        }
    }

    async fn get_owned(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StorageError> {
        match &self.backend {
            Backend::Memory(blocks) => Ok(blocks.read().await.get(cid).map(|b| b.to_vec())),
            Backend::Rocks(db) => {
                let db = Arc::clone(db);
                let key = cid.to_bytes();
                let data = tokio::task::spawn_blocking(move || db.get(&key))
                    .await
                    .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??;
                Ok(data)
            }
        }
    }

    /// Check if a block exists, owned or referenced
    pub async fn has(&self, cid: &Cid) -> bool {
        if self.references.read().await.contains_key(cid) {
            return true;
        }

        match &self.backend {
            Backend::Memory(blocks) => blocks.read().await.contains_key(cid),
            Backend::Rocks(db) => {
                let db = Arc::clone(db);
                let key = cid.to_bytes();
                tokio::task::spawn_blocking(move || {
                    db.get_pinned(&key).map(|opt| opt.is_some()).unwrap_or(false)
                })
                .await
                .unwrap_or(false)
            }
        }
    }

    /// All CIDs in the store, owned and referenced
    pub async fn list_cids(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = match &self.backend {
            Backend::Memory(blocks) => blocks.read().await.keys().copied().collect(),
            Backend::Rocks(db) => {
                let db = Arc::clone(db);
                tokio::task::spawn_blocking(move || {
                    db.iterator(rocksdb::IteratorMode::Start)
                        .flatten()
                        .filter_map(|(key, _)| Cid::try_from(key.as_ref()).ok())
                        .collect()
                })
                .await
                .unwrap_or_default()
            }
        };

        cids.extend(self.references.read().await.keys().copied());
        cids.sort();
        cids.dedup();
        cids
    }

    /// Point a tag at a root, replacing any previous target
    pub async fn set_tag(&self, name: impl Into<String>, root: Cid) {
        let name = name.into();
        debug!("Tag {} -> {}", name, root);
        self.tags.write().await.insert(name, root);
    }

    /// Create a fresh, unused tag pointing at a root
    pub async fn create_tag(&self, root: Cid) -> String {
        let mut tags = self.tags.write().await;
        let name = loop {
            let candidate = format!("auto-{:016x}", rand::random::<u64>());
            if !tags.contains_key(&candidate) {
                break candidate;
            }
        };
        tags.insert(name.clone(), root);
        debug!("Tag {} -> {}", name, root);
        name
    }

    pub async fn tag(&self, name: &str) -> Option<Cid> {
        self.tags.read().await.get(name).copied()
    }

    pub async fn list_tags(&self) -> Vec<(String, Cid)> {
        self.tags
            .read()
            .await
            .iter()
            .map(|(name, cid)| (name.clone(), *cid))
            .collect()
    }

    /// Statistics about owned blocks and references
    pub async fn stats(&self) -> BlockStoreStats {
        let (block_count, total_size) = match &self.backend {
            Backend::Memory(blocks) => {
                let blocks = blocks.read().await;
                (blocks.len(), blocks.values().map(|b| b.len()).sum())
            }
            Backend::Rocks(db) => {
                let db = Arc::clone(db);
                tokio::task::spawn_blocking(move || {
                    db.iterator(rocksdb::IteratorMode::Start)
                        .flatten()
                        .fold((0usize, 0usize), |(count, size), (_, value)| {
                            (count + 1, size + value.len())
                        })
                })
                .await
                .unwrap_or((0, 0))
            }
        };

        BlockStoreStats {
            block_count,
            total_size,
            reference_count: self.references.read().await.len(),
        }
    }
}

async fn read_slice(slice: &FileSlice) -> Result<Vec<u8>, StorageError> {
    let mut file = tokio::fs::File::open(&slice.path).await?;
    file.seek(SeekFrom::Start(slice.offset)).await?;

    let mut data = vec![0u8; slice.len as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

/// Statistics about the block store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStoreStats {
    pub block_count: usize,
    pub total_size: usize,
    pub reference_count: usize,
}
