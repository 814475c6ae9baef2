//! Chunk I/O for connected players: region storage in, deduplicated and
//! compressed payloads out.

use std::borrow::Cow;
use std::time::Duration;

use chunkstore_cache::compression::{compress_payload, CompressionLevels};
use chunkstore_cache::dedup::{ChunkDedupCache, ChunkRecipient, DedupStats, QuitHandle};
use chunkstore_cache::error::CacheError;
use chunkstore_region::{RegionError, RegionFileCache, VerifyReport};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

pub struct ChunkIoService {
    regions: RegionFileCache,
    dedup: ChunkDedupCache,
    dedup_enabled: bool,
    levels: CompressionLevels,
    idle_timeout: Option<Duration>,
}

impl ChunkIoService {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let regions = RegionFileCache::new(
            &config.world.directory,
            config.world.segment_shift,
            config.world.max_open_regions,
        )?;
        info!(
            "Chunk storage at {} (dedup {})",
            config.world.directory.display(),
            if config.cache.enabled { "on" } else { "off" }
        );
        Ok(Self {
            regions,
            dedup: ChunkDedupCache::new(),
            dedup_enabled: config.cache.enabled,
            levels: config.cache.levels(),
            idle_timeout: config.world.idle_timeout(),
        })
    }

    pub fn regions(&mut self) -> &mut RegionFileCache {
        &mut self.regions
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Stored payload of chunk `(x, z)`, if any.
    pub fn load(&mut self, x: i32, z: i32) -> Result<Option<Vec<u8>>> {
        Ok(self.regions.read_chunk(x, z)?)
    }

    pub fn save(&mut self, x: i32, z: i32, payload: &[u8]) -> Result<()> {
        self.regions.write_chunk(x, z, payload)?;
        Ok(())
    }

    /// Load chunk `(x, z)` and build the compressed packet body for
    /// `recipients`. `None` if the chunk was never stored.
    pub fn prepare_send<R: ChunkRecipient>(
        &mut self,
        recipients: &[R],
        x: i32,
        z: i32,
    ) -> Result<Option<Vec<u8>>> {
        let Some(payload) = self.load(x, z)? else {
            return Ok(None);
        };

        let body: Cow<'_, [u8]> = if self.dedup_enabled {
            self.dedup.cache_chunk(recipients, &payload)
        } else {
            Cow::Borrowed(payload.as_slice())
        };
        let compressed = compress_payload(&body, self.levels)?;
        debug!(
            "Prepared chunk ({x}, {z}): {} -> {} bytes",
            body.len(),
            compressed.len()
        );
        Ok(Some(compressed))
    }

    /// Handle that connection tasks keep to report disconnects.
    pub fn quit_handle(&self) -> QuitHandle {
        self.dedup.quit_handle()
    }

    /// Verify every region file in the world directory.
    ///
    /// A region that cannot be opened is reported in place of its
    /// [`VerifyReport`]; the scan carries on with the remaining files.
    pub fn verify_all(&mut self) -> Result<Vec<((i32, i32), std::result::Result<VerifyReport, RegionError>)>> {
        let mut results = Vec::new();
        for (rx, rz) in self.regions.stored_regions()? {
            let outcome = match self.regions.region(rx, rz) {
                Ok(region) => Ok(region.verify()),
                Err(e) => {
                    warn!("Region ({rx}, {rz}) cannot be opened: {e}");
                    Err(e)
                }
            };
            results.push(((rx, rz), outcome));
        }
        Ok(results)
    }

    /// Periodic maintenance: closes idle region files.
    pub fn tick(&mut self) -> Result<usize> {
        match self.idle_timeout {
            Some(timeout) => Ok(self.regions.close_idle(timeout)?),
            None => Ok(0),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.regions.close_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSection, LoggingSection, WorldSection};
    use chunkstore_cache::client::ClientPartitionStore;
    use chunkstore_cache::dedup::PlayerId;
    use chunkstore_cache::compression::decompress_payload;
    use chunkstore_cache::partition::{AUGMENTED_CHUNK_SIZE, FULL_CHUNK_SIZE};
    use rand::Rng;
    use std::path::PathBuf;

    struct Player {
        id: u64,
        modern: bool,
    }

    impl ChunkRecipient for Player {
        fn player_id(&self) -> PlayerId {
            PlayerId(self.id)
        }

        fn supports_partition_cache(&self) -> bool {
            self.modern
        }
    }

    fn test_config(dedup: bool) -> ServerConfig {
        let directory: PathBuf =
            std::env::temp_dir().join(format!("chunkstore_service_{}", rand::random::<u64>()));
        ServerConfig {
            world: WorldSection {
                directory,
                segment_shift: 10,
                max_open_regions: 4,
                idle_timeout_secs: 120,
            },
            cache: CacheSection {
                enabled: dedup,
                ..CacheSection::default()
            },
            logging: LoggingSection {
                level: "info".into(),
            },
        }
    }

    fn random_chunk() -> Vec<u8> {
        let mut data = vec![0u8; FULL_CHUNK_SIZE];
        rand::thread_rng().fill(&mut data[..]);
        data
    }

    #[test]
    fn save_then_load() {
        let config = test_config(true);
        let mut service = ChunkIoService::new(&config).unwrap();
        let data = random_chunk();

        assert!(service.load(3, -7).unwrap().is_none());
        service.save(3, -7, &data).unwrap();
        assert_eq!(service.load(3, -7).unwrap().unwrap(), data);

        service.shutdown().unwrap();
        std::fs::remove_dir_all(&config.world.directory).ok();
    }

    #[test]
    fn prepare_send_missing_chunk() {
        let config = test_config(true);
        let mut service = ChunkIoService::new(&config).unwrap();
        let players = [Player { id: 1, modern: true }];
        assert!(service.prepare_send(&players, 0, 0).unwrap().is_none());
        std::fs::remove_dir_all(&config.world.directory).ok();
    }

    #[test]
    fn prepare_send_round_trips_through_client() {
        let config = test_config(true);
        let mut service = ChunkIoService::new(&config).unwrap();
        let data = random_chunk();
        service.save(10, 10, &data).unwrap();

        let players = [Player { id: 7, modern: true }];
        let mut client = ClientPartitionStore::new();
        for _ in 0..2 {
            let packet = service.prepare_send(&players, 10, 10).unwrap().unwrap();
            let augmented = decompress_payload(&packet).unwrap();
            assert_eq!(augmented.len(), AUGMENTED_CHUNK_SIZE);
            assert_eq!(client.restore(&augmented).unwrap(), data);
        }

        let stats = service.dedup_stats();
        assert_eq!(stats.chunks_processed, 2);
        assert_eq!(stats.partitions_elided, 40);

        service.shutdown().unwrap();
        std::fs::remove_dir_all(&config.world.directory).ok();
    }

    #[test]
    fn legacy_and_disabled_sends_are_plain() {
        let config = test_config(true);
        let mut service = ChunkIoService::new(&config).unwrap();
        let data = random_chunk();
        service.save(0, 0, &data).unwrap();

        let legacy = [Player { id: 1, modern: false }];
        let packet = service.prepare_send(&legacy, 0, 0).unwrap().unwrap();
        assert_eq!(decompress_payload(&packet).unwrap(), data);
        assert_eq!(service.dedup_stats().chunks_bypassed, 1);
        service.shutdown().unwrap();
        std::fs::remove_dir_all(&config.world.directory).ok();

        let config = test_config(false);
        let mut service = ChunkIoService::new(&config).unwrap();
        service.save(0, 0, &data).unwrap();
        let modern = [Player { id: 1, modern: true }];
        let packet = service.prepare_send(&modern, 0, 0).unwrap().unwrap();
        assert_eq!(decompress_payload(&packet).unwrap(), data);
        assert_eq!(service.dedup_stats(), DedupStats::default());
        service.shutdown().unwrap();
        std::fs::remove_dir_all(&config.world.directory).ok();
    }

    #[test]
    fn quit_resets_player_state() {
        let config = test_config(true);
        let mut service = ChunkIoService::new(&config).unwrap();
        let data = random_chunk();
        service.save(1, 1, &data).unwrap();

        let players = [Player { id: 3, modern: true }];
        service.prepare_send(&players, 1, 1).unwrap();
        service.quit_handle().player_quit(PlayerId(3));
        let packet = service.prepare_send(&players, 1, 1).unwrap().unwrap();

        // fresh session: nothing elided, a new client store rebuilds it
        let mut client = ClientPartitionStore::new();
        let augmented = decompress_payload(&packet).unwrap();
        assert_eq!(&augmented[..FULL_CHUNK_SIZE], &data[..]);
        assert_eq!(client.restore(&augmented).unwrap(), data);
        assert_eq!(service.dedup_stats().partitions_elided, 0);

        service.shutdown().unwrap();
        std::fs::remove_dir_all(&config.world.directory).ok();
    }

    #[test]
    fn verify_all_continues_past_corrupt_region() {
        let config = test_config(true);
        let mut service = ChunkIoService::new(&config).unwrap();
        service.save(0, 0, b"healthy").unwrap();
        service.save(40, 0, b"doomed").unwrap();
        service.shutdown().unwrap();

        // invalid segment shift in the header of region (1, 0)
        let path = service.regions().region_path(1, 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8192..8196].copy_from_slice(&99i32.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let results = service.verify_all().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, (0, 0));
        let report = results[0].1.as_ref().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.live_slots, 1);
        assert_eq!(results[1].0, (1, 0));
        assert!(matches!(results[1].1, Err(RegionError::InvalidSegmentShift(99))));

        service.shutdown().unwrap();
        std::fs::remove_dir_all(&config.world.directory).ok();
    }

    #[test]
    fn tick_closes_idle_regions() {
        let mut config = test_config(true);
        config.world.idle_timeout_secs = 0;
        let mut service = ChunkIoService::new(&config).unwrap();
        service.save(0, 0, b"x").unwrap();
        assert_eq!(service.tick().unwrap(), 0);
        assert_eq!(service.regions().open_count(), 1);
        service.shutdown().unwrap();
        assert_eq!(service.regions().open_count(), 0);
        std::fs::remove_dir_all(&config.world.directory).ok();
    }
}
