//! Blob manifests and collections
//!
//! A blob manifest (codec `BLOB_CODEC`) describes one file: its total size
//! and the ordered list of chunk CIDs that make it up. A collection (codec
//! `COLLECTION_CODEC`) names a set of blobs and is how directories travel.
//! Both are encoded with protobuf and stored as ordinary blocks, so the CID
//! of the encoded manifest or collection is the content hash handed out in
//! tickets.

use cid::Cid;
use prost::Message as ProstMessage;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::cid_blake3::{blake3_cid_with_codec, BLOB_CODEC, COLLECTION_CODEC};
use crate::storage::Block;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("CID error: {0}")]
    CidError(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid entry name {name:?}: {reason}")]
    InvalidEntryName { name: String, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

fn block_with_codec(codec: u64, data: Vec<u8>) -> Result<Block> {
    let cid = blake3_cid_with_codec(codec, &data)
        .map_err(|e| ManifestError::CidError(format!("Failed to create CID: {}", e)))?;
    Ok(Block { cid, data })
}

fn expect_codec(block: &Block, codec: u64, what: &str) -> Result<()> {
    let actual = block.cid.codec();
    if actual != codec {
        return Err(ManifestError::InvalidManifest(format!(
            "Block has codec 0x{:x}, expected {} codec 0x{:x}",
            actual, what, codec
        )));
    }
    Ok(())
}

fn cid_from_bytes(bytes: &[u8], what: &str) -> Result<Cid> {
    Cid::try_from(bytes).map_err(|e| ManifestError::CidError(format!("Invalid {}: {}", what, e)))
}

/// Describes the content of a single blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobManifest {
    /// Total content size in bytes
    pub size: u64,
    /// Nominal chunk size used when the blob was ingested
    pub chunk_size: u32,
    /// Chunk CIDs in content order
    pub chunks: Vec<Cid>,
}

impl BlobManifest {
    pub fn new(size: u64, chunk_size: u32, chunks: Vec<Cid>) -> Self {
        Self {
            size,
            chunk_size,
            chunks,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = proto::BlobHeader {
            size: self.size,
            chunk_size: self.chunk_size,
            chunks: self.chunks.iter().map(|cid| cid.to_bytes()).collect(),
        };

        let mut buf = Vec::with_capacity(header.encoded_len());
        header.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = proto::BlobHeader::decode(data)?;

        let chunks = header
            .chunks
            .iter()
            .map(|bytes| cid_from_bytes(bytes, "chunk CID"))
            .collect::<Result<Vec<_>>>()?;

        if header.size > 0 && chunks.is_empty() {
            return Err(ManifestError::InvalidManifest(format!(
                "Blob of {} bytes lists no chunks",
                header.size
            )));
        }

        Ok(Self {
            size: header.size,
            chunk_size: header.chunk_size,
            chunks,
        })
    }

    /// Encode into a block whose CID is the blob's content hash
    pub fn to_block(&self) -> Result<Block> {
        block_with_codec(BLOB_CODEC, self.encode()?)
    }

    pub fn from_block(block: &Block) -> Result<Self> {
        expect_codec(block, BLOB_CODEC, "blob")?;
        Self::decode(&block.data)
    }
}

/// A named blob inside a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    /// Relative path, components separated by `/`
    pub name: String,
    /// Content hash of the blob (a `BLOB_CODEC` CID)
    pub hash: Cid,
}

/// An ordered set of named blobs, usually a directory tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    entries: Vec<CollectionEntry>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, validating its name
    pub fn push(&mut self, name: impl Into<String>, hash: Cid) -> Result<()> {
        let name = name.into();
        validate_entry_name(&name)?;
        self.entries.push(CollectionEntry { name, hash });
        Ok(())
    }

    pub fn entries(&self) -> &[CollectionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = proto::CollectionHeader {
            entries: self
                .entries
                .iter()
                .map(|entry| proto::Entry {
                    name: entry.name.clone(),
                    hash: entry.hash.to_bytes(),
                })
                .collect(),
        };

        let mut buf = Vec::with_capacity(header.encoded_len());
        header.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = proto::CollectionHeader::decode(data)?;

        let mut collection = Collection::new();
        for entry in header.entries {
            let hash = cid_from_bytes(&entry.hash, "entry CID")?;
            if hash.codec() != BLOB_CODEC {
                return Err(ManifestError::InvalidManifest(format!(
                    "Entry {:?} does not reference a blob (codec 0x{:x})",
                    entry.name,
                    hash.codec()
                )));
            }
            collection.push(entry.name, hash)?;
        }

        Ok(collection)
    }

    /// Encode into a block whose CID is the collection's content hash
    pub fn to_block(&self) -> Result<Block> {
        block_with_codec(COLLECTION_CODEC, self.encode()?)
    }

    pub fn from_block(block: &Block) -> Result<Self> {
        expect_codec(block, COLLECTION_CODEC, "collection")?;
        Self::decode(&block.data)
    }
}

/// Check that an entry name is a relative path that stays below its root
pub fn validate_entry_name(name: &str) -> Result<()> {
    let invalid = |reason| ManifestError::InvalidEntryName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.starts_with('/') || name.contains('\\') {
        return Err(invalid("not a relative path"));
    }
    for component in name.split('/') {
        match component {
            "" => return Err(invalid("empty path component")),
            "." | ".." => return Err(invalid("relative path component")),
            _ => {}
        }
    }

    Ok(())
}

/// Resolve an entry name to a path below `root`
pub fn entry_path(root: &Path, name: &str) -> Result<PathBuf> {
    validate_entry_name(name)?;

    let mut path = root.to_path_buf();
    for component in name.split('/') {
        // Reject anything the platform would interpret as more than a plain name
        let mut parts = Path::new(component).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => {
                return Err(ManifestError::InvalidEntryName {
                    name: name.to_string(),
                    reason: "not a plain path component",
                })
            }
        }
    }

    Ok(path)
}

/// Build an entry name from a path relative to an ingestion root
pub fn entry_name(relative: &Path) -> Result<String> {
    let parts = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str().map(str::to_string).ok_or_else(|| {
                ManifestError::InvalidEntryName {
                    name: relative.display().to_string(),
                    reason: "not valid UTF-8",
                }
            }),
            _ => Err(ManifestError::InvalidEntryName {
                name: relative.display().to_string(),
                reason: "not a plain path component",
            }),
        })
        .collect::<Result<Vec<_>>>()?;

    let name = parts.join("/");
    validate_entry_name(&name)?;
    Ok(name)
}

/// Protobuf message definitions
mod proto {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct BlobHeader {
        #[prost(uint64, tag = "1")]
        pub size: u64,
        #[prost(uint32, tag = "2")]
        pub chunk_size: u32,
        /// Chunk CIDs in order
        #[prost(bytes = "vec", repeated, tag = "3")]
        pub chunks: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Entry {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(bytes = "vec", tag = "2")]
        pub hash: Vec<u8>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CollectionHeader {
        #[prost(message, repeated, tag = "1")]
        pub entries: Vec<Entry>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_blake3::blake3_cid;

    fn sample_blob(seed: &[u8]) -> BlobManifest {
        let chunks = vec![blake3_cid(seed).unwrap(), blake3_cid(b"tail").unwrap()];
        BlobManifest::new(70_000, 65_536, chunks)
    }

    #[test]
    fn test_blob_manifest_block() {
        let manifest = sample_blob(b"head");
        let block = manifest.to_block().unwrap();

        assert_eq!(block.cid.codec(), BLOB_CODEC);
        assert_eq!(BlobManifest::from_block(&block).unwrap(), manifest);
    }

    #[test]
    fn test_blob_manifest_cid_is_deterministic() {
        let a = sample_blob(b"head").to_block().unwrap();
        let b = sample_blob(b"head").to_block().unwrap();
        let c = sample_blob(b"other").to_block().unwrap();

        assert_eq!(a.cid, b.cid);
        assert_ne!(a.cid, c.cid);
    }

    #[test]
    fn test_empty_blob_has_a_hash() {
        let block = BlobManifest::new(0, 65_536, Vec::new()).to_block().unwrap();
        let decoded = BlobManifest::from_block(&block).unwrap();

        assert_eq!(decoded.size, 0);
        assert_eq!(decoded.chunk_count(), 0);
    }

    #[test]
    fn test_blob_without_chunks_rejected() {
        let bogus = BlobManifest::new(10, 65_536, Vec::new()).encode().unwrap();
        assert!(matches!(
            BlobManifest::decode(&bogus),
            Err(ManifestError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_collection_block() {
        let blob = sample_blob(b"head").to_block().unwrap().cid;
        let mut collection = Collection::new();
        collection.push("docs/readme.txt", blob).unwrap();
        collection.push("empty.bin", blob).unwrap();

        let block = collection.to_block().unwrap();
        assert_eq!(block.cid.codec(), COLLECTION_CODEC);

        let decoded = Collection::from_block(&block).unwrap();
        assert_eq!(decoded, collection);
        assert_eq!(decoded.entries()[0].name, "docs/readme.txt");
    }

    #[test]
    fn test_empty_collection_has_a_hash() {
        let block = Collection::new().to_block().unwrap();
        assert!(Collection::from_block(&block).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_codec_rejected() {
        let block = sample_blob(b"head").to_block().unwrap();
        match Collection::from_block(&block) {
            Err(ManifestError::InvalidManifest(msg)) => {
                assert!(msg.contains("expected collection codec"))
            }
            other => panic!("Expected InvalidManifest error, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_name_validation() {
        assert!(validate_entry_name("a/b/c.txt").is_ok());
        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("/etc/passwd").is_err());
        assert!(validate_entry_name("a/../b").is_err());
        assert!(validate_entry_name("a//b").is_err());
        assert!(validate_entry_name("./a").is_err());
        assert!(validate_entry_name("a\\b").is_err());
    }

    #[test]
    fn test_entry_path_stays_below_root() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            entry_path(root, "photos/cat.jpg").unwrap(),
            PathBuf::from("/tmp/out/photos/cat.jpg")
        );
        assert!(entry_path(root, "../escape").is_err());
    }

    #[test]
    fn test_entry_name_from_relative_path() {
        let name = entry_name(&Path::new("nested").join("deeper").join("file.txt")).unwrap();
        assert_eq!(name, "nested/deeper/file.txt");
        assert!(entry_name(Path::new("../x")).is_err());
    }
}
