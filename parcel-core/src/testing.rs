//! Scripted blob engine for pipeline tests

use async_trait::async_trait;
use cid::Cid;
use libp2p::PeerId;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cid_blake3::{cid_from_digest, BLOB_CODEC, COLLECTION_CODEC};
use crate::engine::{
    BlobAddOutcome, BlobEngine, EngineError, ExportFormat, ExportMode, SetTagOption, WrapOption,
};
use crate::events::{event_channel, DownloadEvent, EventStream, IngestionEvent};
use crate::ticket::{AddrInfoOptions, BlobFormat, BlobTicket, DownloadOptions, NodeAddr};

/// Replays fixed event sequences and records what it was asked to do
pub struct ScriptedEngine {
    peer_id: PeerId,
    ingestion: Vec<IngestionEvent>,
    download: Vec<DownloadEvent>,
    bytes: Vec<u8>,
    fail_export: bool,
    calls: Mutex<Calls>,
}

#[derive(Default)]
struct Calls {
    ingest: usize,
    download: usize,
    tickets: usize,
    addr_options: Option<AddrInfoOptions>,
    added: Vec<(String, Vec<u8>)>,
    exports: Vec<(Cid, PathBuf, ExportFormat, ExportMode)>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            peer_id: PeerId::random(),
            ingestion: Vec::new(),
            download: Vec::new(),
            bytes: Vec::new(),
            fail_export: false,
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn with_ingestion(mut self, events: Vec<IngestionEvent>) -> Self {
        self.ingestion = events;
        self
    }

    pub fn with_download(mut self, events: Vec<DownloadEvent>) -> Self {
        self.download = events;
        self
    }

    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn with_export_failure(mut self) -> Self {
        self.fail_export = true;
        self
    }

    pub fn blob_hash(seed: u8) -> Cid {
        cid_from_digest(BLOB_CODEC, &[seed; 32]).unwrap()
    }

    pub fn collection_hash(seed: u8) -> Cid {
        cid_from_digest(COLLECTION_CODEC, &[seed; 32]).unwrap()
    }

    pub fn ingest_calls(&self) -> usize {
        self.calls.lock().unwrap().ingest
    }

    pub fn download_calls(&self) -> usize {
        self.calls.lock().unwrap().download
    }

    pub fn tickets_issued(&self) -> usize {
        self.calls.lock().unwrap().tickets
    }

    pub fn last_addr_options(&self) -> Option<AddrInfoOptions> {
        self.calls.lock().unwrap().addr_options
    }

    pub fn added(&self) -> Vec<(String, Vec<u8>)> {
        self.calls.lock().unwrap().added.clone()
    }

    pub fn exports(&self) -> Vec<(Cid, PathBuf, ExportFormat, ExportMode)> {
        self.calls.lock().unwrap().exports.clone()
    }
}

fn replay<T: Send + 'static>(events: Vec<T>) -> EventStream<T> {
    let (sink, stream) = event_channel();
    tokio::spawn(async move {
        for event in events {
            if sink.send(event).await.is_err() {
                break;
            }
        }
    });
    stream
}

#[async_trait]
impl BlobEngine for ScriptedEngine {
    async fn ingest(
        &self,
        _path: &Path,
        _in_place: bool,
        _tag: SetTagOption,
        _wrap: WrapOption,
    ) -> Result<EventStream<IngestionEvent>, EngineError> {
        self.calls.lock().unwrap().ingest += 1;
        Ok(replay(self.ingestion.clone()))
    }

    async fn add_named_bytes(
        &self,
        content: Vec<u8>,
        name: &str,
    ) -> Result<BlobAddOutcome, EngineError> {
        let size = content.len() as u64;
        self.calls
            .lock()
            .unwrap()
            .added
            .push((name.to_string(), content));
        Ok(BlobAddOutcome {
            hash: Self::blob_hash(0),
            format: BlobFormat::Raw,
            size,
            tag: name.to_string(),
        })
    }

    async fn issue_ticket(
        &self,
        hash: Cid,
        format: BlobFormat,
        addr_options: AddrInfoOptions,
    ) -> Result<BlobTicket, EngineError> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.tickets += 1;
            calls.addr_options = Some(addr_options);
        }
        Ok(BlobTicket::new(NodeAddr::new(self.peer_id), hash, format)?)
    }

    async fn download(
        &self,
        _hash: Cid,
        _options: DownloadOptions,
    ) -> Result<EventStream<DownloadEvent>, EngineError> {
        self.calls.lock().unwrap().download += 1;
        Ok(replay(self.download.clone()))
    }

    async fn read_bytes(&self, _hash: &Cid) -> Result<Vec<u8>, EngineError> {
        Ok(self.bytes.clone())
    }

    async fn export(
        &self,
        hash: &Cid,
        destination: &Path,
        format: ExportFormat,
        mode: ExportMode,
    ) -> Result<(), EngineError> {
        if self.fail_export {
            return Err(EngineError::Conflict(destination.to_path_buf()));
        }
        self.calls.lock().unwrap().exports.push((
            *hash,
            destination.to_path_buf(),
            format,
            mode,
        ));
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<Cid>, EngineError> {
        Ok(Vec::new())
    }
}
