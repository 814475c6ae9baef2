//! Segment-addressed region files.
//!
//! A region file stores up to 1024 independently deflated chunk blobs for a
//! 32x32 area of chunk columns. All integers are big-endian.
//!
//! Layout:
//! - `[0, 4096)`: segment start of each slot (`i32[1024]`)
//! - `[4096, 8192)`: byte length of each slot (`i32[1024]`)
//! - `[8192, 8196)`: segment size shift (`i32`)
//! - segment-aligned chunk blobs after the header's reserved segments
//!
//! Slot index for local chunk `(x, z)` is `x * 32 + z`.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::allocator::SegmentAllocator;
use crate::error::{RegionError, Result};

// ─── Format constants ───────────────────────────────────────────────────────

/// Chunk columns per region edge.
pub const REGION_SIZE: i32 = 32;

/// Slots per region file (32x32).
pub const SLOT_COUNT: usize = (REGION_SIZE * REGION_SIZE) as usize;

const START_TABLE_OFFSET: usize = 0;
const LENGTH_TABLE_OFFSET: usize = START_TABLE_OFFSET + 4 * SLOT_COUNT;
const SHIFT_OFFSET: usize = LENGTH_TABLE_OFFSET + 4 * SLOT_COUNT;

/// Header bytes: both FAT tables plus the segment shift.
pub const HEADER_SIZE: usize = SHIFT_OFFSET + 4;

/// Smallest accepted segment size shift (16 bytes).
pub const MIN_SEGMENT_SHIFT: u32 = 4;
/// Largest accepted segment size shift (16 MiB).
pub const MAX_SEGMENT_SHIFT: u32 = 24;

/// Shift used when nothing else is configured (1 KiB segments).
pub const DEFAULT_SEGMENT_SHIFT: u32 = 10;

/// Compressed reader over one stored chunk blob.
pub type ChunkReader = ZlibDecoder<Cursor<Vec<u8>>>;

// ─── FAT entries ────────────────────────────────────────────────────────────

/// One entry of the file allocation table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotEntry {
    /// First segment of the blob.
    pub start: u32,
    /// Segments allocated, always `ceil(length / segment_size)`.
    pub segments: u32,
    /// Blob length in bytes.
    pub length: u32,
}

impl SlotEntry {
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Segment range `[start, start + segments)` owned by this slot.
    pub fn segment_range(&self) -> std::ops::Range<usize> {
        let start = self.start as usize;
        start..start + self.segments as usize
    }
}

/// Result of [`RegionFile::verify`].
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Slots holding data.
    pub live_slots: usize,
    /// Sum of stored (compressed) blob lengths.
    pub stored_bytes: u64,
    /// Sum of decompressed lengths of readable slots.
    pub raw_bytes: u64,
    /// Chunks that failed to read back, with the reason.
    pub problems: Vec<((i32, i32), RegionError)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

// ─── Region file ────────────────────────────────────────────────────────────

/// An open region file.
///
/// Not internally synchronized: one owner reads and writes a region at a
/// time.
pub struct RegionFile {
    path: PathBuf,
    file: File,
    region_x: i32,
    region_z: i32,
    shift: u32,
    slots: Vec<SlotEntry>,
    segments: SegmentAllocator,
    last_access: Instant,
}

impl RegionFile {
    /// Open or create the region file at `path` for region `(region_x, region_z)`.
    ///
    /// A file shorter than the header is (re)initialized with an empty FAT
    /// and `default_shift`. Otherwise the stored shift wins.
    pub fn open(
        path: impl AsRef<Path>,
        region_x: i32,
        region_z: i32,
        default_shift: u32,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !(MIN_SEGMENT_SHIFT..=MAX_SEGMENT_SHIFT).contains(&default_shift) {
            return Err(RegionError::InvalidSegmentShift(default_shift as i32));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let fresh = file_len < HEADER_SIZE as u64;
        let (shift, slots) = if fresh {
            (default_shift, vec![SlotEntry::default(); SLOT_COUNT])
        } else {
            let mut header = vec![0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            parse_header(&header)?
        };

        let mut region = Self {
            path,
            file,
            region_x,
            region_z,
            shift,
            slots,
            segments: SegmentAllocator::new(0),
            last_access: Instant::now(),
        };

        if fresh {
            region.write_header()?;
        }
        region.rebuild_segments(file_len)?;
        region.pad_to_segment_boundary()?;

        debug!(
            "Opened region ({region_x}, {region_z}) at {} ({} live slots, {}-byte segments)",
            region.path.display(),
            region.live_slots(),
            region.segment_size()
        );
        Ok(region)
    }

    /// Rebuild the occupancy map from the header and slot table.
    fn rebuild_segments(&mut self, file_len: u64) -> Result<()> {
        let file_segments = self.segments_for(file_len as usize);
        let mut segments = SegmentAllocator::new(file_segments);

        let header_segments = self.segments_for(HEADER_SIZE);
        segments.reserve(0, header_segments);

        for (slot, entry) in self.slots.iter().enumerate() {
            if entry.is_empty() {
                continue;
            }
            if entry.start as usize + entry.segments as usize > file_segments {
                warn!(
                    "Region {} slot {slot} points past the end of the file",
                    self.path.display()
                );
                return Err(RegionError::CorruptSlot { slot });
            }
            if !segments.reserve(entry.start as usize, entry.segments as usize) {
                warn!(
                    "Region {} slot {slot} overlaps another allocation",
                    self.path.display()
                );
                return Err(RegionError::OverlappingSlot { slot });
            }
        }

        self.segments = segments;
        Ok(())
    }

    /// Grow the file so its length is a whole number of segments.
    fn pad_to_segment_boundary(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        let aligned = (self.segments_for(len as usize) as u64) << self.shift;
        if aligned > len {
            debug!(
                "Extending region {} from {len} to {aligned} bytes",
                self.path.display()
            );
            self.file.set_len(aligned)?;
        }
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region_x(&self) -> i32 {
        self.region_x
    }

    pub fn region_z(&self) -> i32 {
        self.region_z
    }

    /// log2 of the segment size.
    pub fn segment_shift(&self) -> u32 {
        self.shift
    }

    pub fn segment_size(&self) -> usize {
        1 << self.shift
    }

    /// Segments currently covered by the occupancy map.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Occupied segments, header included.
    pub fn used_segments(&self) -> usize {
        self.segments.used_count()
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Whether the file has not been touched for longer than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_access.elapsed() > timeout
    }

    /// Number of slots holding data.
    pub fn live_slots(&self) -> usize {
        self.slots.iter().filter(|entry| !entry.is_empty()).count()
    }

    /// Absolute chunk coordinates and FAT entry of every slot holding data.
    pub fn chunks(&self) -> impl Iterator<Item = ((i32, i32), SlotEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_empty())
            .map(|(index, entry)| (self.chunk_coords(index), *entry))
    }

    /// Whether chunk `(x, z)` has stored data.
    pub fn has_chunk(&self, x: i32, z: i32) -> bool {
        !self.slots[self.slot_index(x, z)].is_empty()
    }

    /// FAT entry for chunk `(x, z)`.
    pub fn slot(&self, x: i32, z: i32) -> SlotEntry {
        self.slots[self.slot_index(x, z)]
    }

    // ─── Coordinates ────────────────────────────────────────────────────

    /// Slot index of absolute chunk `(x, z)`.
    ///
    /// # Panics
    ///
    /// Panics if the chunk lies outside this region.
    fn slot_index(&self, x: i32, z: i32) -> usize {
        assert!(
            x >> 5 == self.region_x && z >> 5 == self.region_z,
            "chunk ({x}, {z}) is outside region ({}, {})",
            self.region_x,
            self.region_z
        );
        let local_x = (x & (REGION_SIZE - 1)) as usize;
        let local_z = (z & (REGION_SIZE - 1)) as usize;
        local_x * REGION_SIZE as usize + local_z
    }

    fn chunk_coords(&self, index: usize) -> (i32, i32) {
        let local_x = (index / REGION_SIZE as usize) as i32;
        let local_z = (index % REGION_SIZE as usize) as i32;
        (
            self.region_x * REGION_SIZE + local_x,
            self.region_z * REGION_SIZE + local_z,
        )
    }

    fn segments_for(&self, size: usize) -> usize {
        if size == 0 {
            0
        } else {
            ((size - 1) >> self.shift) + 1
        }
    }

    // ─── Reading ────────────────────────────────────────────────────────

    /// Read the stored (compressed) blob of chunk `(x, z)`.
    pub fn read_slot(&mut self, x: i32, z: i32) -> Result<Vec<u8>> {
        self.touch();
        let entry = self.slot(x, z);
        if entry.is_empty() {
            return Err(RegionError::EmptySlot { x, z });
        }

        let offset = (entry.start as u64) << self.shift;
        let length = entry.length as usize;
        let available = self.file_len()?;
        if offset + length as u64 > available {
            return Err(RegionError::Truncated {
                x,
                z,
                expected: length,
                available: available.saturating_sub(offset),
            });
        }

        let mut data = vec![0u8; length];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Open a decompressing reader over chunk `(x, z)`.
    pub fn chunk_reader(&mut self, x: i32, z: i32) -> Result<ChunkReader> {
        let data = self.read_slot(x, z)?;
        Ok(ZlibDecoder::new(Cursor::new(data)))
    }

    /// Read and decompress chunk `(x, z)`.
    pub fn read_chunk(&mut self, x: i32, z: i32) -> Result<Vec<u8>> {
        let mut reader = self.chunk_reader(x, z)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    // ─── Writing ────────────────────────────────────────────────────────

    /// Open a compressing writer for chunk `(x, z)`.
    ///
    /// Output is buffered in memory and committed by [`ChunkWriter::finish`].
    pub fn chunk_writer(&mut self, x: i32, z: i32) -> ChunkWriter<'_> {
        let index = self.slot_index(x, z);
        self.touch();
        ChunkWriter {
            region: self,
            index,
            encoder: Some(ZlibEncoder::new(Vec::new(), Compression::default())),
        }
    }

    /// Compress and store `data` as chunk `(x, z)`.
    pub fn write_chunk(&mut self, x: i32, z: i32, data: &[u8]) -> Result<()> {
        let mut writer = self.chunk_writer(x, z);
        writer.write_all(data)?;
        writer.finish()
    }

    /// Store an already compressed blob as chunk `(x, z)`.
    pub fn write_slot(&mut self, x: i32, z: i32, data: &[u8]) -> Result<()> {
        let index = self.slot_index(x, z);
        self.write(index, data)
    }

    /// Replace the blob in slot `index`.
    ///
    /// The slot's previous run is freed first, then the first free run large
    /// enough is taken, scanning from segment 0. The whole header is
    /// rewritten before returning.
    fn write(&mut self, index: usize, data: &[u8]) -> Result<()> {
        if data.len() > i32::MAX as usize {
            return Err(RegionError::ChunkTooLarge { size: data.len() });
        }
        self.touch();

        let old = self.slots[index];
        self.segments
            .release(old.start as usize, old.segments as usize);

        let count = self.segments_for(data.len());
        let start = if count == 0 {
            0
        } else {
            self.segments.allocate(count)
        };

        if count > 0 {
            if let Err(e) = self.write_data(start, count, data) {
                self.segments.release(start, count);
                self.segments
                    .reserve(old.start as usize, old.segments as usize);
                return Err(e);
            }
        }

        self.slots[index] = SlotEntry {
            start: start as u32,
            segments: count as u32,
            length: data.len() as u32,
        };
        self.write_header()
    }

    fn write_data(&mut self, start: usize, count: usize, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start((start as u64) << self.shift))?;
        self.file.write_all(data)?;

        let end = ((start + count) as u64) << self.shift;
        if self.file_len()? < end {
            self.file.set_len(end)?;
        }
        Ok(())
    }

    /// Rewrite the whole FAT and segment shift.
    fn write_header(&mut self) -> Result<()> {
        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        for entry in &self.slots {
            header.put_i32(entry.start as i32);
        }
        for entry in &self.slots {
            header.put_i32(entry.length as i32);
        }
        header.put_i32(self.shift as i32);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.flush()?;
        Ok(())
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    // ─── Maintenance ────────────────────────────────────────────────────

    /// Read back every live slot and report the ones that fail.
    pub fn verify(&mut self) -> VerifyReport {
        let mut report = VerifyReport::default();
        let live: Vec<((i32, i32), SlotEntry)> = self.chunks().collect();

        for ((x, z), entry) in live {
            report.live_slots += 1;
            report.stored_bytes += entry.length as u64;
            match self.read_chunk(x, z) {
                Ok(data) => report.raw_bytes += data.len() as u64,
                Err(e) => report.problems.push(((x, z), e)),
            }
        }
        report
    }

    /// Flush and sync the file, releasing the handle.
    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        debug!(
            "Closed region ({}, {}) at {}",
            self.region_x,
            self.region_z,
            self.path.display()
        );
        Ok(())
    }
}

/// Parse the header into the segment shift and slot table.
fn parse_header(mut header: &[u8]) -> Result<(u32, Vec<SlotEntry>)> {
    let mut starts = Vec::with_capacity(SLOT_COUNT);
    for _ in 0..SLOT_COUNT {
        starts.push(header.get_i32());
    }
    let mut lengths = Vec::with_capacity(SLOT_COUNT);
    for _ in 0..SLOT_COUNT {
        lengths.push(header.get_i32());
    }

    let shift = header.get_i32();
    if shift < MIN_SEGMENT_SHIFT as i32 || shift > MAX_SEGMENT_SHIFT as i32 {
        return Err(RegionError::InvalidSegmentShift(shift));
    }
    let shift = shift as u32;

    let mut slots = Vec::with_capacity(SLOT_COUNT);
    for (slot, (&start, &length)) in starts.iter().zip(&lengths).enumerate() {
        if start < 0 || length < 0 {
            return Err(RegionError::CorruptSlot { slot });
        }
        let segments = if length == 0 {
            0
        } else {
            ((length as u32 - 1) >> shift) + 1
        };
        slots.push(SlotEntry {
            start: start as u32,
            segments,
            length: length as u32,
        });
    }
    Ok((shift, slots))
}

// ─── Chunk writer ───────────────────────────────────────────────────────────

/// Compressing writer for a single chunk.
///
/// Data is deflated into memory; [`finish`](Self::finish) stores it in the
/// region. A writer dropped without `finish` discards its output and leaves
/// the slot untouched.
pub struct ChunkWriter<'a> {
    region: &'a mut RegionFile,
    index: usize,
    encoder: Option<ZlibEncoder<Vec<u8>>>,
}

impl ChunkWriter<'_> {
    /// Finish compression and store the chunk.
    pub fn finish(mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let data = encoder.finish()?;
            self.region.write(self.index, &data)?;
        }
        Ok(())
    }

    fn encoder(&mut self) -> io::Result<&mut ZlibEncoder<Vec<u8>>> {
        self.encoder
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "chunk writer already committed"))
    }
}

impl Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder()?.flush()
    }
}

impl Drop for ChunkWriter<'_> {
    fn drop(&mut self) {
        if self.encoder.is_some() {
            warn!(
                "Discarded unfinished write to chunk slot {} of {}",
                self.index,
                self.region.path.display()
            );
        }
    }
}
