//! Partition addressing over a full chunk payload.
//!
//! A full payload is the block id array followed by the metadata, block light
//! and sky light nibble arrays of a 16x128x16 column, all in `(x*16 + z)*128 + y`
//! order. It splits into 40 partitions of 256 runs of 8 bytes each, one run
//! per column:
//! - partitions 0..16 cover the block array, stride 128
//! - partitions 16..40 cover the three nibble arrays (8 each), stride 64
//!
//! The augmented buffer sent to players appends one big-endian `u64` hash per
//! partition after the payload.

use std::ops::Range;

use crate::hash::Fnv1a64;

/// Uncompressed full chunk payload: `16 * 128 * 16 * 5 / 2` bytes.
pub const FULL_CHUNK_SIZE: usize = 16 * 128 * 16 * 5 / 2;

pub const PARTITION_COUNT: usize = 40;

/// Bytes per partition (256 runs of 8).
pub const PARTITION_SIZE: usize = COLUMNS * RUN_LENGTH;

/// Offset of the hash trailer in an augmented buffer.
pub const HASH_TRAILER_OFFSET: usize = FULL_CHUNK_SIZE;

pub const HASH_TRAILER_SIZE: usize = PARTITION_COUNT * 8;

/// Payload plus hash trailer.
pub const AUGMENTED_CHUNK_SIZE: usize = FULL_CHUNK_SIZE + HASH_TRAILER_SIZE;

/// One gathered partition.
pub type Partition = [u8; PARTITION_SIZE];

const COLUMNS: usize = 16 * 16;
const RUN_LENGTH: usize = 8;
const BLOCK_ARRAY_SIZE: usize = 16 * 128 * 16;
const NIBBLE_ARRAY_SIZE: usize = BLOCK_ARRAY_SIZE / 2;
const BLOCK_PARTITIONS: usize = 16;
const PARTITIONS_PER_NIBBLE_ARRAY: usize = 8;

const TABLES: ([usize; PARTITION_COUNT], [usize; PARTITION_COUNT]) = build_tables();

/// First byte of each partition.
const START_POINT: [usize; PARTITION_COUNT] = TABLES.0;
/// Distance between consecutive runs of each partition.
const STRIDE: [usize; PARTITION_COUNT] = TABLES.1;

const fn build_tables() -> ([usize; PARTITION_COUNT], [usize; PARTITION_COUNT]) {
    let mut start = [0; PARTITION_COUNT];
    let mut stride = [0; PARTITION_COUNT];

    let mut index = 0;
    while index < BLOCK_PARTITIONS {
        start[index] = index * RUN_LENGTH;
        stride[index] = 128;
        index += 1;
    }
    while index < PARTITION_COUNT {
        let nibble = index - BLOCK_PARTITIONS;
        let array = nibble / PARTITIONS_PER_NIBBLE_ARRAY;
        let slice = nibble % PARTITIONS_PER_NIBBLE_ARRAY;
        start[index] = BLOCK_ARRAY_SIZE + array * NIBBLE_ARRAY_SIZE + slice * RUN_LENGTH;
        stride[index] = 64;
        index += 1;
    }
    (start, stride)
}

/// Byte ranges of partition `index`, in gather order.
///
/// # Panics
///
/// Panics if `index >= PARTITION_COUNT`.
pub fn runs(index: usize) -> impl Iterator<Item = Range<usize>> {
    assert!(index < PARTITION_COUNT, "partition index {index} out of range");
    let start = START_POINT[index];
    let stride = STRIDE[index];
    (0..COLUMNS).map(move |column| {
        let offset = start + column * stride;
        offset..offset + RUN_LENGTH
    })
}

/// Gather partition `index` of `buffer` into `out`.
pub fn copy_from_chunk_data(buffer: &[u8], index: usize, out: &mut Partition) {
    for (run, chunk) in runs(index).zip(out.chunks_exact_mut(RUN_LENGTH)) {
        chunk.copy_from_slice(&buffer[run]);
    }
}

/// Scatter `input` into partition `index` of `buffer`.
///
/// With `None` the partition's bytes are zeroed instead.
pub fn copy_to_chunk_data(buffer: &mut [u8], index: usize, input: Option<&Partition>) {
    match input {
        Some(input) => {
            for (run, chunk) in runs(index).zip(input.chunks_exact(RUN_LENGTH)) {
                buffer[run].copy_from_slice(chunk);
            }
        }
        None => {
            for run in runs(index) {
                buffer[run].fill(0);
            }
        }
    }
}

/// Content hash of partition `index` of `buffer`.
pub fn partition_hash(buffer: &[u8], index: usize) -> u64 {
    let mut hasher = Fnv1a64::new();
    for run in runs(index) {
        hasher.update(&buffer[run]);
    }
    hasher.finish()
}

fn hash_offset(index: usize) -> usize {
    assert!(index < PARTITION_COUNT, "partition index {index} out of range");
    HASH_TRAILER_OFFSET + index * 8
}

/// Read the trailer hash of partition `index`.
pub fn get_hash(buffer: &[u8], index: usize) -> u64 {
    let offset = hash_offset(index);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Write the trailer hash of partition `index`.
pub fn set_hash(buffer: &mut [u8], index: usize, value: u64) {
    let offset = hash_offset(index);
    buffer[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}
