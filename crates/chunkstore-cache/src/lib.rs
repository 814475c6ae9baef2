//! Partition-level dedup of chunk data sent to players.

pub mod client;
pub mod compression;
pub mod dedup;
pub mod error;
pub mod hash;
pub mod partition;
