//! Receiving side of partition dedup.
//!
//! Keeps every partition seen so far keyed by its hash and fills elided
//! partitions back in from that store.

use std::collections::HashMap;

use crate::error::CacheError;
use crate::partition::{
    copy_from_chunk_data, copy_to_chunk_data, get_hash, partition_hash, Partition,
    AUGMENTED_CHUNK_SIZE, FULL_CHUNK_SIZE, PARTITION_COUNT, PARTITION_SIZE,
};

/// Hash → partition content store for one connection.
#[derive(Default)]
pub struct ClientPartitionStore {
    partitions: HashMap<u64, Box<Partition>>,
}

impl ClientPartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct partitions held.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn clear(&mut self) {
        self.partitions.clear();
    }

    /// Rebuild the full payload from an augmented buffer.
    ///
    /// Known hashes are restored from the store; unknown ones must match
    /// their content and are recorded.
    pub fn restore(&mut self, augmented: &[u8]) -> Result<Vec<u8>, CacheError> {
        if augmented.len() != AUGMENTED_CHUNK_SIZE {
            return Err(CacheError::PayloadLength {
                expected: AUGMENTED_CHUNK_SIZE,
                got: augmented.len(),
            });
        }

        let mut payload = augmented[..FULL_CHUNK_SIZE].to_vec();
        for index in 0..PARTITION_COUNT {
            let hash = get_hash(augmented, index);
            if let Some(stored) = self.partitions.get(&hash) {
                copy_to_chunk_data(&mut payload, index, Some(stored.as_ref()));
                continue;
            }

            if partition_hash(&payload, index) != hash {
                return Err(CacheError::HashMismatch { partition: index });
            }
            let mut content = Box::new([0u8; PARTITION_SIZE]);
            copy_from_chunk_data(&payload, index, &mut content);
            self.partitions.insert(hash, content);
        }
        Ok(payload)
    }
}
