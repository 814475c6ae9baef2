//! On-disk chunk storage: segment-addressed region files.

pub mod allocator;
pub mod cache;
pub mod error;
pub mod region;

pub use cache::{region_coords, RegionFileCache};
pub use error::RegionError;
pub use region::{ChunkReader, ChunkWriter, RegionFile, SlotEntry, VerifyReport};
