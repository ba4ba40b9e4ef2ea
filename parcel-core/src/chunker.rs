//! Fixed-size chunking of file content
//!
//! Ingestion splits every file into chunks of `DEFAULT_CHUNK_SIZE` bytes
//! (the last one may be shorter). Each chunk remembers where it started in
//! the source so that in-place ingestion can record a reference instead of
//! copying the bytes.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size: 64 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A chunk of source content and its offset in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Reads from an async reader and splits the stream into fixed-size chunks
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    eof_reached: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Create a new chunker with the default chunk size
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    /// Create a new chunker with a custom chunk size
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self {
            reader,
            chunk_size,
            offset: 0,
            eof_reached: false,
        }
    }

    /// Read the next chunk
    ///
    /// Returns `Ok(None)` once the reader is exhausted. An empty source
    /// produces no chunks at all.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        if self.eof_reached {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_read = 0;

        while total_read < self.chunk_size {
            match self.reader.read(&mut buffer[total_read..]).await? {
                0 => {
                    self.eof_reached = true;
                    break;
                }
                n => total_read += n,
            }
        }

        if total_read == 0 {
            return Ok(None);
        }

        buffer.truncate(total_read);
        let chunk = Chunk {
            offset: self.offset,
            data: Bytes::from(buffer),
        };
        self.offset += total_read as u64;

        Ok(Some(chunk))
    }
}

impl<R> Chunker<R> {
    /// Total bytes handed out so far
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    #[cfg(test)]
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
