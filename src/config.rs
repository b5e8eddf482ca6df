//! Engine configuration: block-size bounds, memcache sizing, flush mode.

use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest block size a file may be created with (8 KiB).
pub const MIN_BLOCK_SIZE: u32 = 8 * 1024;
/// Largest block size a file may be created with (1 MiB).
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
/// Engine default used when a file is created without an explicit size (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Read-through memcache sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemcacheConfig {
    /// Maximum number of cached entities.
    pub capacity: u64,
    /// Entry time-to-live; `None` keeps entries until evicted by capacity.
    pub ttl: Option<Duration>,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Block size applied when file creation does not specify one.
    pub default_block_size: u32,
    /// When true, flushes run inside a datastore transaction so a batch
    /// applies all-or-nothing.
    pub write_through: bool,
    pub memcache: MemcacheConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            write_through: false,
            memcache: MemcacheConfig::default(),
        }
    }
}

impl FsConfig {
    /// Validate a per-file block size against the permitted range. The size
    /// is fixed at file creation and immutable afterward.
    pub fn validate_block_size(size: u32) -> FsResult<u32> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
            return Err(FsError::unsupported_option(format!(
                "block size {size} outside permitted range [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]"
            )));
        }
        Ok(size)
    }
}
