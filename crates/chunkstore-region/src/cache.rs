//! Bounded set of open region files for one world directory.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::region::RegionFile;

const REGION_EXTENSION: &str = "srf";

/// Region coordinates containing chunk `(x, z)`.
pub fn region_coords(chunk_x: i32, chunk_z: i32) -> (i32, i32) {
    (chunk_x >> 5, chunk_z >> 5)
}

/// File name of region `(region_x, region_z)`: `r.<x>.<z>.srf`.
pub fn region_file_name(region_x: i32, region_z: i32) -> String {
    format!("r.{region_x}.{region_z}.{REGION_EXTENSION}")
}

/// Parse a region file name back into region coordinates.
pub fn parse_region_file_name(name: &str) -> Option<(i32, i32)> {
    let mut parts = name.split('.');
    if parts.next()? != "r" {
        return None;
    }
    let x = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    if parts.next()? != REGION_EXTENSION || parts.next().is_some() {
        return None;
    }
    Some((x, z))
}

/// Keeps up to `max_open` region files open, keyed by region coordinates.
///
/// When full, the least recently accessed file is closed before another is
/// opened.
pub struct RegionFileCache {
    directory: PathBuf,
    segment_shift: u32,
    max_open: usize,
    open: HashMap<(i32, i32), RegionFile>,
}

impl RegionFileCache {
    /// Create a cache over `directory`, creating the directory if needed.
    pub fn new(directory: impl Into<PathBuf>, segment_shift: u32, max_open: usize) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            segment_shift,
            max_open: max_open.max(1),
            open: HashMap::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of currently open region files.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn region_path(&self, region_x: i32, region_z: i32) -> PathBuf {
        self.directory.join(region_file_name(region_x, region_z))
    }

    /// Region coordinates of every region file in the directory.
    pub fn stored_regions(&self) -> Result<Vec<(i32, i32)>> {
        let mut regions = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            if let Some(coords) = entry.file_name().to_str().and_then(parse_region_file_name) {
                regions.push(coords);
            }
        }
        regions.sort_unstable();
        Ok(regions)
    }

    /// Open (or reuse) region `(region_x, region_z)`.
    pub fn region(&mut self, region_x: i32, region_z: i32) -> Result<&mut RegionFile> {
        let key = (region_x, region_z);
        if !self.open.contains_key(&key) {
            self.evict_if_full()?;
        }

        let path = self.region_path(region_x, region_z);
        let shift = self.segment_shift;
        let region = match self.open.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(RegionFile::open(path, region_x, region_z, shift)?),
        };
        Ok(region)
    }

    /// Open (or reuse) the region containing chunk `(x, z)`.
    pub fn region_for_chunk(&mut self, x: i32, z: i32) -> Result<&mut RegionFile> {
        let (region_x, region_z) = region_coords(x, z);
        self.region(region_x, region_z)
    }

    /// Whether chunk `(x, z)` is stored. Never creates a region file.
    pub fn has_chunk(&mut self, x: i32, z: i32) -> Result<bool> {
        if !self.region_exists(x, z) {
            return Ok(false);
        }
        Ok(self.region_for_chunk(x, z)?.has_chunk(x, z))
    }

    /// Read and decompress chunk `(x, z)`, or `None` if it was never stored.
    pub fn read_chunk(&mut self, x: i32, z: i32) -> Result<Option<Vec<u8>>> {
        if !self.region_exists(x, z) {
            return Ok(None);
        }
        let region = self.region_for_chunk(x, z)?;
        if !region.has_chunk(x, z) {
            return Ok(None);
        }
        region.read_chunk(x, z).map(Some)
    }

    /// Compress and store chunk `(x, z)`.
    pub fn write_chunk(&mut self, x: i32, z: i32, data: &[u8]) -> Result<()> {
        self.region_for_chunk(x, z)?.write_chunk(x, z, data)
    }

    /// Close regions idle for longer than `timeout`. Returns how many closed.
    pub fn close_idle(&mut self, timeout: Duration) -> Result<usize> {
        let idle: Vec<(i32, i32)> = self
            .open
            .iter()
            .filter(|(_, region)| region.is_timed_out(timeout))
            .map(|(&key, _)| key)
            .collect();

        for key in &idle {
            if let Some(region) = self.open.remove(key) {
                region.close()?;
            }
        }
        if !idle.is_empty() {
            debug!("Closed {} idle region file(s)", idle.len());
        }
        Ok(idle.len())
    }

    /// Flush and close every open region.
    pub fn close_all(&mut self) -> Result<()> {
        let count = self.open.len();
        for (_, region) in self.open.drain() {
            region.close()?;
        }
        if count > 0 {
            info!("Closed {count} region file(s) in {}", self.directory.display());
        }
        Ok(())
    }

    fn region_exists(&self, x: i32, z: i32) -> bool {
        let (region_x, region_z) = region_coords(x, z);
        self.open.contains_key(&(region_x, region_z))
            || self.region_path(region_x, region_z).exists()
    }

    fn evict_if_full(&mut self) -> Result<()> {
        if self.open.len() < self.max_open {
            return Ok(());
        }
        let oldest = self
            .open
            .iter()
            .min_by_key(|(_, region)| region.last_access())
            .map(|(&key, _)| key);

        if let Some(key) = oldest {
            if let Some(region) = self.open.remove(&key) {
                debug!("Evicting region ({}, {})", key.0, key.1);
                region.close()?;
            }
        }
        Ok(())
    }
}
