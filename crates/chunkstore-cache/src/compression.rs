//! Zlib compression of outgoing chunk payloads.
//!
//! The level depends only on the uncompressed length: buffers shorter than a
//! quarter of a full chunk use the cheaper level. Full and augmented chunk
//! buffers are always above the threshold, elided partitions or not.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::CacheError;
use crate::partition::FULL_CHUNK_SIZE;

/// Payloads shorter than this are compressed with [`CompressionLevels::partial`].
pub const REDUCED_DEFLATE_THRESHOLD: usize = FULL_CHUNK_SIZE / 4;

/// Deflate levels for full and partial payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevels {
    pub full: u32,
    pub partial: u32,
}

impl Default for CompressionLevels {
    fn default() -> Self {
        Self { full: 6, partial: 1 }
    }
}

impl CompressionLevels {
    /// Level to use for a payload of `len` bytes.
    pub fn level_for(&self, len: usize) -> u32 {
        if len < REDUCED_DEFLATE_THRESHOLD {
            self.partial
        } else {
            self.full
        }
    }
}

/// Compress a payload with the level chosen by its size.
pub fn compress_payload(data: &[u8], levels: CompressionLevels) -> Result<Vec<u8>, CacheError> {
    let level = levels.level_for(data.len()).min(9);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| CacheError::CompressError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::CompressError(e.to_string()))
}

pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| CacheError::DecompressError(e.to_string()))?;
    Ok(output)
}
