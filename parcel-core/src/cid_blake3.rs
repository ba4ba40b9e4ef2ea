//! CID-based content addressing with BLAKE3
//!
//! Every object Parcel stores is named by a CIDv1 whose multihash is a
//! BLAKE3-256 digest of the object's bytes. The CID codec tells the three
//! kinds of objects apart:
//!
//! - raw chunks of file content (`RAW_CODEC`)
//! - blob manifests listing the chunks of one file (`BLOB_CODEC`)
//! - collections naming a set of blobs (`COLLECTION_CODEC`)

use cid::Cid;
use multihash::Multihash;
use std::io::{self, Read};
use thiserror::Error;

/// BLAKE3-256 multihash code
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
pub const BLAKE3_CODE: u64 = 0x1e;

/// Raw binary codec, used for content chunks
pub const RAW_CODEC: u64 = 0x55;

/// Blob manifest codec (private-use range)
pub const BLOB_CODEC: u64 = 0x30_0001;

/// Collection codec (private-use range)
pub const COLLECTION_CODEC: u64 = 0x30_0002;

/// Size of a BLAKE3 digest in bytes
const DIGEST_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Unsupported hash function 0x{0:x}")]
    UnsupportedHash(u64),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// Compute the BLAKE3 digest of data
pub fn blake3_hash(data: &[u8]) -> [u8; DIGEST_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Build a CIDv1 from a BLAKE3 digest and a codec
pub fn cid_from_digest(codec: u64, digest: &[u8]) -> Result<Cid, CidError> {
    let mh = Multihash::wrap(BLAKE3_CODE, digest)
        .map_err(|e| CidError::Multihash(format!("Failed to create multihash: {}", e)))?;
    Ok(Cid::new_v1(codec, mh))
}

/// Compute the CID of data under the given codec
pub fn blake3_cid_with_codec(codec: u64, data: &[u8]) -> Result<Cid, CidError> {
    cid_from_digest(codec, &blake3_hash(data))
}

/// Compute the CID of a raw content chunk
pub fn blake3_cid(data: &[u8]) -> Result<Cid, CidError> {
    blake3_cid_with_codec(RAW_CODEC, data)
}

/// Streaming BLAKE3 verifier
///
/// Used when content arrives in pieces, e.g. when an in-place source file
/// is re-hashed chunk by chunk before it is hard-linked into an export.
pub struct StreamingVerifier {
    hasher: blake3::Hasher,
    expected_cid: Cid,
}

impl StreamingVerifier {
    /// Create a verifier that checks the result against `expected_cid`
    pub fn new_with_cid(expected_cid: Cid) -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            expected_cid,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Read from a reader until EOF, hashing everything
    pub fn update_from_reader<R: Read>(&mut self, reader: &mut R) -> Result<u64, io::Error> {
        let mut buffer = [0u8; 8192];
        let mut total_read = 0u64;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }

            self.update(&buffer[..n]);
            total_read += n as u64;
        }

        Ok(total_read)
    }

    /// Finalize and verify against the expected CID
    pub fn finalize_and_verify(self) -> Result<Cid, CidError> {
        let computed_cid =
            cid_from_digest(self.expected_cid.codec(), self.hasher.finalize().as_bytes())?;

        if computed_cid != self.expected_cid {
            return Err(CidError::HashMismatch {
                expected: self.expected_cid.to_string(),
                actual: computed_cid.to_string(),
            });
        }

        Ok(computed_cid)
    }
}

/// Verify data against a CID, honouring the CID's codec
pub fn verify_blake3(data: &[u8], expected_cid: &Cid) -> Result<(), CidError> {
    let code = expected_cid.hash().code();
    if code != BLAKE3_CODE {
        return Err(CidError::UnsupportedHash(code));
    }

    let computed_cid = blake3_cid_with_codec(expected_cid.codec(), data)?;

    if &computed_cid != expected_cid {
        return Err(CidError::HashMismatch {
            expected: expected_cid.to_string(),
            actual: computed_cid.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from bytes
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, CidError> {
    Cid::try_from(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))
}
