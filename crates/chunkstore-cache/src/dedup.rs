//! Per-player partition dedup for outgoing chunk data.
//!
//! For every eligible send the cache hashes each partition of the payload,
//! stamps the hashes into a trailer, and zeroes partitions whose exact
//! content was already sent to that player. State is per player: two players
//! never share elision decisions.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::partition::{
    copy_to_chunk_data, partition_hash, set_hash, AUGMENTED_CHUNK_SIZE, FULL_CHUNK_SIZE,
    PARTITION_COUNT,
};

/// Identifies a connected player for the length of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recipient of a chunk send.
pub trait ChunkRecipient {
    fn player_id(&self) -> PlayerId;

    /// Whether the client can rebuild elided partitions from the trailer.
    fn supports_partition_cache(&self) -> bool;
}

/// Cloneable, thread-safe handle for reporting disconnects.
///
/// Quits are queued and applied at the start of the next
/// [`ChunkDedupCache::cache_chunk`] call.
#[derive(Debug, Clone)]
pub struct QuitHandle {
    tx: mpsc::UnboundedSender<PlayerId>,
}

impl QuitHandle {
    pub fn player_quit(&self, id: PlayerId) {
        // Fails only once the cache is gone, and with it all player state.
        if self.tx.send(id).is_err() {
            debug!("Dedup cache dropped before quit of player {id}");
        }
    }
}

/// Running totals for a [`ChunkDedupCache`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Sends that went through partition hashing.
    pub chunks_processed: u64,
    /// Sends passed through unchanged.
    pub chunks_bypassed: u64,
    /// Partitions left intact in processed sends.
    pub partitions_sent: u64,
    /// Partitions zeroed in processed sends.
    pub partitions_elided: u64,
}

/// Tracks, per player, every partition hash sent during the session.
///
/// The hash sets are owned by the thread that calls `cache_chunk`; only the
/// quit queue is shared.
pub struct ChunkDedupCache {
    active_hashes: HashMap<PlayerId, HashSet<u64>>,
    quit_tx: mpsc::UnboundedSender<PlayerId>,
    quit_rx: mpsc::UnboundedReceiver<PlayerId>,
    stats: DedupStats,
}

impl ChunkDedupCache {
    pub fn new() -> Self {
        let (quit_tx, quit_rx) = mpsc::unbounded_channel();
        Self {
            active_hashes: HashMap::new(),
            quit_tx,
            quit_rx,
            stats: DedupStats::default(),
        }
    }

    /// Handle for reporting disconnects from other threads.
    pub fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            tx: self.quit_tx.clone(),
        }
    }

    /// Queue `id` for removal. The player's state is dropped lazily.
    pub fn player_quit(&self, id: PlayerId) {
        // The receiver lives in `self`, so this cannot fail.
        let _ = self.quit_tx.send(id);
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Number of players with recorded hashes.
    pub fn tracked_players(&self) -> usize {
        self.active_hashes.len()
    }

    /// Number of distinct partition hashes recorded for `id`.
    pub fn known_hashes(&self, id: PlayerId) -> usize {
        self.active_hashes.get(&id).map_or(0, HashSet::len)
    }

    /// Prepare `data` for sending to `recipients`.
    ///
    /// Applies only to a single recipient with partition cache support and a
    /// full-size payload; anything else is returned unchanged. Otherwise the
    /// result is the payload with already-seen partitions zeroed, followed
    /// by the hash trailer.
    pub fn cache_chunk<'a, R: ChunkRecipient>(
        &mut self,
        recipients: &[R],
        data: &'a [u8],
    ) -> Cow<'a, [u8]> {
        self.drain_quits();

        let recipient = match recipients {
            [only] if data.len() == FULL_CHUNK_SIZE && only.supports_partition_cache() => only,
            _ => {
                self.stats.chunks_bypassed += 1;
                return Cow::Borrowed(data);
            }
        };

        let id = recipient.player_id();
        let mut buffer = vec![0u8; AUGMENTED_CHUNK_SIZE];
        buffer[..FULL_CHUNK_SIZE].copy_from_slice(data);

        let hashes = self.active_hashes.entry(id).or_default();
        let mut elided = 0;
        for index in 0..PARTITION_COUNT {
            let hash = partition_hash(&buffer, index);
            set_hash(&mut buffer, index, hash);
            if hashes.insert(hash) {
                continue;
            }
            copy_to_chunk_data(&mut buffer, index, None);
            elided += 1;
        }

        self.stats.chunks_processed += 1;
        self.stats.partitions_elided += elided;
        self.stats.partitions_sent += PARTITION_COUNT as u64 - elided;
        debug!("Chunk for player {id}: elided {elided}/{PARTITION_COUNT} partitions");

        Cow::Owned(buffer)
    }

    fn drain_quits(&mut self) {
        while let Ok(id) = self.quit_rx.try_recv() {
            if let Some(hashes) = self.active_hashes.remove(&id) {
                debug!("Dropped {} partition hashes of player {id}", hashes.len());
            }
        }
    }
}

impl Default for ChunkDedupCache {
    fn default() -> Self {
        Self::new()
    }
}
