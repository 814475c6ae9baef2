//! Region file error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("region I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk ({x}, {z}) has no stored data")]
    EmptySlot { x: i32, z: i32 },

    #[error("chunk ({x}, {z}) is truncated: expected {expected} bytes, file holds {available}")]
    Truncated {
        x: i32,
        z: i32,
        expected: usize,
        available: u64,
    },

    #[error("slot {slot} holds a negative start or length, or points past the end of the file")]
    CorruptSlot { slot: usize },

    #[error("slot {slot} overlaps segments owned by another slot or the header")]
    OverlappingSlot { slot: usize },

    #[error("invalid segment size shift: {0}")]
    InvalidSegmentShift(i32),

    #[error("chunk blob of {size} bytes exceeds the region format limit")]
    ChunkTooLarge { size: usize },
}

pub type Result<T> = std::result::Result<T, RegionError>;
