//! kvfs: a POSIX-like virtual filesystem engine whose persistence is a
//! key-value entity datastore.
//!
//! The backing platform offers only string-keyed entities with per-entity
//! atomic operations, bounded bulk calls, optional transactions, and a
//! memcache layer. On top of that this crate provides files with
//! random-access read/write and per-file block sizes, folders with
//! enumerable children, metadata views, rename and copy, and a path/lock
//! discipline that keeps directory and file operations race-free within
//! the process.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod lock;
pub mod node;
pub mod path;
pub mod store;

// Public surface for embedding the engine.
pub use crate::config::{DEFAULT_BLOCK_SIZE, FsConfig, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, MemcacheConfig};
pub use crate::error::{FsError, FsResult};
pub use crate::fs::{AccessMode, FileHandle, KvFs, MoveOptions, OpenOptions};
pub use crate::node::{
    AttrView, CopyOptions, DirEntry, FileAttributes, FileNode, FileType, LocalOverlay,
};
pub use crate::store::{Datastore, DatastoreClient, DatastoreTx, Entity, Key, MemoryDatastore};
