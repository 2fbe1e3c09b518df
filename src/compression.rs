//! Object framing codec
//!
//! Every blob in a repository's object store carries a 4-byte header that
//! says how the payload is stored:
//!
//! - `LZ4T` (0x4C5A3454): an LZ4 block with its decoded size prepended
//! - `\0\0\0\0`: the payload is stored as-is
//!
//! Readers only ever decode. [`ObjectCodec::encode`] exists so tooling and
//! tests can produce objects in the same format the backup writer uses.
//!
//! ## Examples
//!
//! ```rust
//! use rewind::compression::ObjectCodec;
//!
//! let codec = ObjectCodec::new();
//! let data = b"Some file content that repeats. ".repeat(64);
//! let framed = codec.encode(&data);
//! assert!(framed.starts_with(b"LZ4T"));
//! assert_eq!(codec.decode(&framed)?, data);
//! # Ok::<(), rewind::RewindError>(())
//! ```

use crate::error::{Result, RewindError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Magic bytes of LZ4 framed objects
pub const LZ4_MAGIC: &[u8; 4] = b"LZ4T";

/// Magic bytes of raw objects
pub const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Payloads smaller than this are never worth compressing
const MIN_COMPRESS_SIZE: usize = 64;

/// Decode counters for monitoring
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodecStats {
    /// Objects decoded from LZ4 frames
    pub lz4_objects: u64,
    /// Objects decoded from raw frames
    pub raw_objects: u64,
    /// Decoded bytes produced
    pub bytes_decoded: u64,
}

/// Encoder/decoder for framed objects
///
/// The codec is stateless apart from its counters and can be shared
/// between threads.
#[derive(Debug, Default)]
pub struct ObjectCodec {
    lz4_objects: AtomicU64,
    raw_objects: AtomicU64,
    bytes_decoded: AtomicU64,
}

impl ObjectCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame content for storage
    ///
    /// Content is LZ4-compressed when that makes it smaller, otherwise
    /// stored raw.
    pub fn encode(&self, content: &[u8]) -> Vec<u8> {
        if content.len() >= MIN_COMPRESS_SIZE {
            let compressed = compress_prepend_size(content);
            if compressed.len() < content.len() {
                let mut framed = Vec::with_capacity(LZ4_MAGIC.len() + compressed.len());
                framed.extend_from_slice(LZ4_MAGIC);
                framed.extend_from_slice(&compressed);
                return framed;
            }
        }

        let mut framed = Vec::with_capacity(RAW_MAGIC.len() + content.len());
        framed.extend_from_slice(RAW_MAGIC);
        framed.extend_from_slice(content);
        framed
    }

    /// Decode a framed object
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::Decompression`] if:
    /// - The frame is shorter than its header
    /// - The header is not a known magic
    /// - The LZ4 payload is corrupt
    pub fn decode(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < 4 {
            return Err(RewindError::decompression("Content too short"));
        }

        let (magic, payload) = framed.split_at(4);
        let decoded = if magic == LZ4_MAGIC {
            let decoded = decompress_size_prepended(payload)
                .map_err(|e| RewindError::decompression(format!("LZ4 decompression failed: {}", e)))?;
            self.lz4_objects.fetch_add(1, Ordering::Relaxed);
            decoded
        } else if magic == RAW_MAGIC {
            self.raw_objects.fetch_add(1, Ordering::Relaxed);
            payload.to_vec()
        } else {
            return Err(RewindError::decompression(format!(
                "Unknown object header {}",
                hex::encode(magic)
            )));
        };

        trace!("Decoded {} bytes to {} bytes", framed.len(), decoded.len());
        self.bytes_decoded.fetch_add(decoded.len() as u64, Ordering::Relaxed);
        Ok(decoded)
    }

    /// Snapshot of the decode counters
    pub fn stats(&self) -> CodecStats {
        CodecStats {
            lz4_objects: self.lz4_objects.load(Ordering::Relaxed),
            raw_objects: self.raw_objects.load(Ordering::Relaxed),
            bytes_decoded: self.bytes_decoded.load(Ordering::Relaxed),
        }
    }
}
