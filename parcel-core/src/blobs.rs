//! Block-store backed blob engine
//!
//! [`Blobs`] implements [`BlobEngine`] on top of the local [`BlockStore`]
//! and, when online, the block exchange protocol. Files are split into
//! fixed-size chunks, each chunk is stored as a raw block, and a blob
//! manifest listing the chunk CIDs becomes the blob's content hash.
//! Directories become collections of named blobs.

use async_trait::async_trait;
use cid::Cid;
use futures::stream::{self, StreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::chunker::{Chunker, DEFAULT_CHUNK_SIZE};
use crate::cid_blake3::{
    blake3_cid, CidError, StreamingVerifier, BLOB_CODEC, COLLECTION_CODEC, RAW_CODEC,
};
use crate::engine::{
    BlobAddOutcome, BlobEngine, EngineError, ExportFormat, ExportMode, SetTagOption, WrapOption,
};
use crate::events::{event_channel, DownloadEvent, EventSink, EventStream, IngestionEvent};
use crate::manifest::{entry_name, entry_path, BlobManifest, Collection};
use crate::p2p::NetworkHandle;
use crate::storage::{Block, BlockStore, FileSlice};
use crate::ticket::{AddrInfoOptions, BlobFormat, BlobTicket, DownloadOptions, NodeAddr};

/// Chunk requests kept in flight per download
const FETCH_CONCURRENCY: usize = 16;

/// Blob engine over a local block store
#[derive(Clone)]
pub struct Blobs {
    store: Arc<BlockStore>,
    network: Option<NetworkHandle>,
    chunk_size: usize,
}

impl Blobs {
    /// Engine that serves and fetches over the given network
    pub fn new(store: Arc<BlockStore>, network: NetworkHandle) -> Self {
        Self {
            store,
            network: Some(network),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Engine restricted to local content
    pub fn offline(store: Arc<BlockStore>) -> Self {
        Self {
            store,
            network: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self, EngineError> {
        if chunk_size == 0 {
            return Err(EngineError::InvalidChunkSize);
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn network(&self) -> Option<&NetworkHandle> {
        self.network.as_ref()
    }

    /// Every tag and the root it protects
    pub async fn list_tags(&self) -> Vec<(String, Cid)> {
        self.store.list_tags().await
    }

    /// Content of a blob, chunk by chunk
    async fn blob_chunks(&self, hash: &Cid) -> Result<BlobManifest, EngineError> {
        let block = self.local_block(hash).await?;
        Ok(BlobManifest::from_block(&block)?)
    }

    async fn local_block(&self, cid: &Cid) -> Result<Block, EngineError> {
        if !self.store.has(cid).await {
            return Err(EngineError::NotFound(*cid));
        }
        Ok(self.store.get(cid).await?)
    }

    async fn export_blob(
        &self,
        hash: &Cid,
        destination: &Path,
        mode: ExportMode,
    ) -> Result<(), EngineError> {
        let manifest = self.blob_chunks(hash).await?;

        if tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(EngineError::Conflict(destination.to_path_buf()));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if mode == ExportMode::TryReference {
            if let Some(source) = self.store.source(hash).await {
                match self.link_verified(&manifest, &source, destination).await {
                    Ok(()) => {
                        debug!("Linked {} from {:?} to {:?}", hash, source, destination);
                        return Ok(());
                    }
                    Err(e) => {
                        debug!("Could not link {:?}, copying instead: {}", source, e);
                    }
                }
            }
        }

        let mut file = tokio::fs::File::create(destination).await?;
        for chunk in &manifest.chunks {
            let block = self.local_block(chunk).await?;
            file.write_all(&block.data).await?;
        }
        file.flush().await?;

        debug!(
            "Exported {} ({} bytes) to {:?}",
            hash, manifest.size, destination
        );
        Ok(())
    }

    /// Hard-link an in-place source after checking it still matches its chunks
    async fn link_verified(
        &self,
        manifest: &BlobManifest,
        source: &Path,
        destination: &Path,
    ) -> Result<(), EngineError> {
        let expected = manifest.clone();
        let path = source.to_path_buf();
        tokio::task::spawn_blocking(move || verify_source(&expected, &path))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        if tokio::fs::symlink_metadata(destination).await.is_ok() {
            tokio::fs::remove_file(destination).await?;
        }
        tokio::fs::hard_link(source, destination).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobEngine for Blobs {
    async fn ingest(
        &self,
        path: &Path,
        in_place: bool,
        tag: SetTagOption,
        wrap: WrapOption,
    ) -> Result<EventStream<IngestionEvent>, EngineError> {
        let path = tokio::fs::canonicalize(path)
            .await
            .map_err(|_| EngineError::MissingPath(path.to_path_buf()))?;
        let is_dir = tokio::fs::metadata(&path).await?.is_dir();

        let (events, stream) = event_channel();
        let ingestor = Ingestor {
            store: Arc::clone(&self.store),
            chunk_size: self.chunk_size,
            in_place,
            events: events.clone(),
        };

        tokio::spawn(async move {
            let terminal = match ingestor.run(&path, is_dir, wrap).await {
                Ok((hash, format)) => {
                    let tag = apply_tag(&ingestor.store, tag, hash).await;
                    info!("Ingested {:?} as {} {}", path, format, hash);
                    IngestionEvent::AllComplete { hash, format, tag }
                }
                Err(e) => {
                    warn!("Ingestion of {:?} failed: {}", path, e);
                    IngestionEvent::Abort {
                        reason: e.to_string(),
                    }
                }
            };
            let _ = events.send(terminal).await;
        });

        Ok(stream)
    }

    async fn add_named_bytes(
        &self,
        content: Vec<u8>,
        name: &str,
    ) -> Result<BlobAddOutcome, EngineError> {
        let size = content.len() as u64;
        let hash = store_blob(&self.store, &content[..], self.chunk_size, None, None).await?;

        let tag = if name.is_empty() {
            self.store.create_tag(hash).await
        } else {
            self.store.set_tag(name, hash).await;
            name.to_string()
        };

        debug!("Added {} bytes as {} ({})", size, hash, tag);
        Ok(BlobAddOutcome {
            hash,
            format: BlobFormat::Raw,
            size,
            tag,
        })
    }

    async fn issue_ticket(
        &self,
        hash: Cid,
        format: BlobFormat,
        addr_options: AddrInfoOptions,
    ) -> Result<BlobTicket, EngineError> {
        let network = self.network.as_ref().ok_or(EngineError::Offline)?;
        if !self.store.has(&hash).await {
            return Err(EngineError::NotFound(hash));
        }

        let node = addr_options.apply(network.node_addr().await?);
        debug!(
            "Issuing ticket for {} with {} relay and {} direct addresses",
            hash,
            node.relay_addrs.len(),
            node.direct_addrs.len()
        );
        Ok(BlobTicket::new(node, hash, format)?)
    }

    async fn download(
        &self,
        hash: Cid,
        options: DownloadOptions,
    ) -> Result<EventStream<DownloadEvent>, EngineError> {
        let (events, stream) = event_channel();
        let fetcher = Fetcher {
            store: Arc::clone(&self.store),
            network: self.network.clone(),
            peer: options.node,
        };

        tokio::spawn(async move {
            let terminal = match fetcher.download(hash, options.format, &events).await {
                Ok(bytes_written) => {
                    info!("Downloaded {} ({} bytes)", hash, bytes_written);
                    DownloadEvent::AllDone { bytes_written }
                }
                Err(e) => {
                    warn!("Download of {} failed: {}", hash, e);
                    DownloadEvent::Abort {
                        reason: e.to_string(),
                    }
                }
            };
            let _ = events.send(terminal).await;
        });

        Ok(stream)
    }

    async fn read_bytes(&self, hash: &Cid) -> Result<Vec<u8>, EngineError> {
        match hash.codec() {
            BLOB_CODEC => {
                let manifest = self.blob_chunks(hash).await?;
                let mut data = Vec::with_capacity(manifest.size as usize);
                for chunk in &manifest.chunks {
                    data.extend_from_slice(&self.local_block(chunk).await?.data);
                }
                Ok(data)
            }
            COLLECTION_CODEC | RAW_CODEC => Ok(self.local_block(hash).await?.data),
            other => Err(EngineError::UnsupportedCodec(other)),
        }
    }

    async fn export(
        &self,
        hash: &Cid,
        destination: &Path,
        format: ExportFormat,
        mode: ExportMode,
    ) -> Result<(), EngineError> {
        match (format, hash.codec()) {
            (ExportFormat::Blob, BLOB_CODEC) => self.export_blob(hash, destination, mode).await,
            (ExportFormat::Collection, COLLECTION_CODEC) => {
                let collection = Collection::from_block(&self.local_block(hash).await?)?;

                if tokio::fs::metadata(destination)
                    .await
                    .map(|m| !m.is_dir())
                    .unwrap_or(false)
                {
                    return Err(EngineError::Conflict(destination.to_path_buf()));
                }
                tokio::fs::create_dir_all(destination).await?;

                for entry in collection.entries() {
                    let path = entry_path(destination, &entry.name)?;
                    self.export_blob(&entry.hash, &path, mode).await?;
                }

                info!(
                    "Exported collection {} ({} entries) to {:?}",
                    hash,
                    collection.len(),
                    destination
                );
                Ok(())
            }
            (_, codec) => Err(EngineError::UnsupportedCodec(codec)),
        }
    }

    async fn list_blobs(&self) -> Result<Vec<Cid>, EngineError> {
        Ok(self
            .store
            .list_cids()
            .await
            .into_iter()
            .filter(|cid| cid.codec() != RAW_CODEC)
            .collect())
    }
}

/// Re-hash a source file chunk by chunk against its manifest
fn verify_source(manifest: &BlobManifest, path: &Path) -> Result<(), EngineError> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len != manifest.size {
        return Err(CidError::HashMismatch {
            expected: format!("{} bytes", manifest.size),
            actual: format!("{} bytes", len),
        }
        .into());
    }

    for chunk in &manifest.chunks {
        let mut verifier = StreamingVerifier::new_with_cid(*chunk);
        verifier.update_from_reader(&mut (&mut file).take(manifest.chunk_size as u64))?;
        verifier.finalize_and_verify()?;
    }
    Ok(())
}

async fn apply_tag(store: &BlockStore, tag: SetTagOption, hash: Cid) -> String {
    match tag {
        SetTagOption::Auto => store.create_tag(hash).await,
        SetTagOption::Named(name) => {
            store.set_tag(name.clone(), hash).await;
            name
        }
    }
}

/// Progress sink for a single file being stored
struct FileProgress<'a> {
    events: &'a EventSink<IngestionEvent>,
    name: &'a str,
}

/// Chunk `reader` into the store and store the blob manifest
///
/// With a `source`, chunks are recorded as references into that file
/// instead of being copied.
async fn store_blob<R: AsyncRead + Unpin>(
    store: &BlockStore,
    reader: R,
    chunk_size: usize,
    source: Option<&Path>,
    progress: Option<FileProgress<'_>>,
) -> Result<Cid, EngineError> {
    let mut chunker = Chunker::with_chunk_size(reader, chunk_size);
    let mut chunks = Vec::new();

    while let Some(chunk) = chunker.next_chunk().await? {
        let cid = blake3_cid(&chunk.data)?;
        match source {
            Some(path) => {
                store
                    .put_reference(
                        cid,
                        FileSlice {
                            path: path.to_path_buf(),
                            offset: chunk.offset,
                            len: chunk.len() as u64,
                        },
                    )
                    .await
            }
            None => {
                store
                    .put(Block {
                        cid,
                        data: chunk.data.to_vec(),
                    })
                    .await?
            }
        }
        chunks.push(cid);

        if let Some(progress) = &progress {
            let _ = progress
                .events
                .send(IngestionEvent::Progress {
                    name: progress.name.to_string(),
                    offset: chunk.end(),
                })
                .await;
        }
    }

    let manifest = BlobManifest::new(chunker.bytes_read(), chunk_size as u32, chunks);
    let block = manifest.to_block()?;
    let hash = block.cid;
    store.put(block).await?;

    if let Some(path) = source {
        store.set_source(hash, path.to_path_buf()).await;
    }

    trace!(
        "Stored blob {} ({} bytes, {} chunks)",
        hash,
        manifest.size,
        manifest.chunk_count()
    );
    Ok(hash)
}

/// One ingestion run
struct Ingestor {
    store: Arc<BlockStore>,
    chunk_size: usize,
    in_place: bool,
    events: EventSink<IngestionEvent>,
}

impl Ingestor {
    async fn run(
        &self,
        path: &Path,
        is_dir: bool,
        wrap: WrapOption,
    ) -> Result<(Cid, BlobFormat), EngineError> {
        let own_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("data")
            .to_string();

        let prefix = match wrap {
            WrapOption::NoWrap => None,
            WrapOption::Wrap { name } => Some(name.unwrap_or_else(|| own_name.clone())),
        };

        if !is_dir {
            let hash = self.add_file(path, prefix.as_deref().unwrap_or(&own_name)).await?;
            return match prefix {
                None => Ok((hash, BlobFormat::Raw)),
                Some(prefix) => {
                    let mut collection = Collection::new();
                    collection.push(prefix, hash)?;
                    self.finish_collection(collection).await
                }
            };
        }

        let files = walk_files(path).await?;
        debug!("Found {} files below {:?}", files.len(), path);

        let mut collection = Collection::new();
        for relative in files {
            let mut name = entry_name(&relative)?;
            if let Some(prefix) = &prefix {
                name = format!("{}/{}", prefix, name);
            }
            let hash = self.add_file(&path.join(&relative), &name).await?;
            collection.push(name, hash)?;
        }

        self.finish_collection(collection).await
    }

    async fn finish_collection(
        &self,
        collection: Collection,
    ) -> Result<(Cid, BlobFormat), EngineError> {
        let block = collection.to_block()?;
        let hash = block.cid;
        self.store.put(block).await?;
        Ok((hash, BlobFormat::Collection))
    }

    async fn add_file(&self, path: &Path, name: &str) -> Result<Cid, EngineError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.emit(IngestionEvent::Found {
            name: name.to_string(),
            size,
        })
        .await;

        let progress = FileProgress {
            events: &self.events,
            name,
        };
        let source = self.in_place.then_some(path);
        let hash = store_blob(&self.store, file, self.chunk_size, source, Some(progress)).await?;

        self.emit(IngestionEvent::UnitComplete {
            name: name.to_string(),
            hash,
        })
        .await;
        Ok(hash)
    }

    async fn emit(&self, event: IngestionEvent) {
        // The consumer may have stopped listening; the content is stored regardless
        let _ = self.events.send(event).await;
    }
}

/// Regular files below `root`, relative to it, in sorted order
///
/// Symlinks to files are followed; symlinked directories are skipped.
async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let relative = dir.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push(relative);
            } else if file_type.is_file() {
                files.push(relative);
            } else if file_type.is_symlink() {
                match tokio::fs::metadata(entry.path()).await {
                    Ok(meta) if meta.is_file() => files.push(relative),
                    Ok(_) => warn!("Skipping symlinked directory {:?}", entry.path()),
                    Err(e) => warn!("Skipping dangling symlink {:?}: {}", entry.path(), e),
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Resolves blocks for one download, local store first
struct Fetcher {
    store: Arc<BlockStore>,
    network: Option<NetworkHandle>,
    peer: NodeAddr,
}

impl Fetcher {
    async fn block(&self, cid: Cid) -> Result<Block, EngineError> {
        if self.store.has(&cid).await {
            match self.store.get(&cid).await {
                Ok(block) => return Ok(block),
                Err(e) => warn!("Local copy of {} unusable, fetching: {}", cid, e),
            }
        }

        let network = self.network.as_ref().ok_or(EngineError::Offline)?;
        if network.local_peer_id() == self.peer.peer_id {
            return Err(EngineError::NotFound(cid));
        }

        let data = network
            .fetch_block(&self.peer, cid)
            .await?
            .ok_or(EngineError::NotFound(cid))?;
        let block = Block::from_cid_and_data(cid, data)?;
        self.store.put(block.clone()).await?;
        trace!("Fetched {} ({} bytes) from {}", cid, block.size(), self.peer.peer_id);
        Ok(block)
    }

    async fn download(
        &self,
        hash: Cid,
        format: BlobFormat,
        events: &EventSink<DownloadEvent>,
    ) -> Result<u64, EngineError> {
        if BlobFormat::from_codec(hash.codec()) != Some(format) {
            return Err(crate::ticket::TicketError::FormatMismatch {
                codec: hash.codec(),
                format,
            }
            .into());
        }

        let root = self.block(hash).await?;
        let blobs = match format {
            BlobFormat::Raw => vec![BlobManifest::from_block(&root)?],
            BlobFormat::Collection => {
                let collection = Collection::from_block(&root)?;
                let mut blobs = Vec::with_capacity(collection.len());
                for entry in collection.entries() {
                    blobs.push(BlobManifest::from_block(&self.block(entry.hash).await?)?);
                }
                blobs
            }
        };

        let total_size: u64 = blobs.iter().map(|b| b.size).sum();
        let _ = events.send(DownloadEvent::Found { total_size }).await;

        let chunks: Vec<Cid> = blobs
            .iter()
            .flat_map(|b| b.chunks.iter().copied())
            .collect();
        let mut fetched = stream::iter(chunks)
            .map(|cid| self.block(cid))
            .buffered(FETCH_CONCURRENCY);

        let mut offset = 0u64;
        while let Some(block) = fetched.next().await {
            offset += block?.size() as u64;
            let _ = events.send(DownloadEvent::Progress { offset }).await;
        }

        if offset != total_size {
            return Err(crate::manifest::ManifestError::InvalidManifest(format!(
                "Manifests declare {} bytes but chunks hold {}",
                total_size, offset
            ))
            .into());
        }

        Ok(offset)
    }
}
