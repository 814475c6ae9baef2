use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chunkstore_cache::compression::CompressionLevels;
use chunkstore_region::region::DEFAULT_SEGMENT_SHIFT;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub world: WorldSection,
    #[serde(default)]
    pub cache: CacheSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct WorldSection {
    /// Directory holding the `r.<x>.<z>.srf` region files.
    pub directory: PathBuf,
    /// log2 of the segment size. Only applies to newly created regions.
    #[serde(default = "default_segment_shift")]
    pub segment_shift: u32,
    #[serde(default = "default_max_open_regions")]
    pub max_open_regions: usize,
    /// Regions untouched for this many seconds are closed on tick. 0 = never.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_segment_shift() -> u32 {
    DEFAULT_SEGMENT_SHIFT
}

fn default_max_open_regions() -> usize {
    64
}

fn default_idle_timeout_secs() -> u64 {
    120
}

impl WorldSection {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_deflate_level_full")]
    pub deflate_level_full: u32,
    #[serde(default = "default_deflate_level_partial")]
    pub deflate_level_partial: u32,
}

fn default_true() -> bool {
    true
}

fn default_deflate_level_full() -> u32 {
    6
}

fn default_deflate_level_partial() -> u32 {
    1
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            deflate_level_full: default_deflate_level_full(),
            deflate_level_partial: default_deflate_level_partial(),
        }
    }
}

impl CacheSection {
    pub fn levels(&self) -> CompressionLevels {
        CompressionLevels {
            full: self.deflate_level_full,
            partial: self.deflate_level_partial,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    pub level: String,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}
