//! Chunk cache errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("chunk payload has {got} bytes, expected {expected}")]
    PayloadLength { expected: usize, got: usize },

    #[error("partition {partition} content does not match its hash")]
    HashMismatch { partition: usize },

    #[error("compression error: {0}")]
    CompressError(String),

    #[error("decompression error: {0}")]
    DecompressError(String),
}
