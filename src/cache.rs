//! Process-wide block cache with per-block dirty tracking.
//!
//! Payloads live here between a write and the flush that persists them;
//! reads populate the cache so repeated access stays in memory. A dirty
//! entry is pinned: eviction only ever removes clean entries, and flushed
//! blocks become clean before any eviction can see them.

use crate::store::Key;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct CachedBlock {
    data: Vec<u8>,
    dirty: bool,
}

/// Map from block key to cached payload. Shared by every node of one engine
/// instance; per-key serialisation comes from the map's shard locks, so no
/// guard is ever held across an await point.
#[derive(Default)]
pub struct BlockCache {
    map: DashMap<Key, CachedBlock>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn is_dirty(&self, key: &Key) -> bool {
        self.map.get(key).is_some_and(|b| b.dirty)
    }

    /// Copy `[offset, offset + buf.len())` of a cached block into `buf`,
    /// zero-filling past the stored payload. Returns false on a cache miss.
    pub fn read_into(&self, key: &Key, offset: usize, buf: &mut [u8]) -> bool {
        match self.map.get(key) {
            Some(block) => {
                buf.fill(0);
                let src = &block.data;
                let end = (offset + buf.len()).min(src.len());
                if end > offset {
                    buf[..end - offset].copy_from_slice(&src[offset..end]);
                }
                true
            }
            None => false,
        }
    }

    /// Insert a block fetched from the datastore. An existing entry wins:
    /// it is either dirty (newer than the store) or an equivalent copy.
    pub fn insert_clean(&self, key: Key, data: Vec<u8>) {
        self.map.entry(key).or_insert(CachedBlock { data, dirty: false });
    }

    /// Write `data` at `offset` within the block, creating or zero-extending
    /// the entry as needed, and mark it dirty. `offset + data.len()` must
    /// not exceed the owning file's block size; callers split spans first.
    pub fn write_into(&self, key: Key, offset: usize, data: &[u8]) {
        let mut entry = self.map.entry(key).or_insert(CachedBlock {
            data: Vec::new(),
            dirty: false,
        });
        let end = offset + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset..end].copy_from_slice(data);
        entry.dirty = true;
    }

    /// Shorten a cached block's payload to `len` bytes and mark it dirty.
    /// Used by truncate so the dropped tail reads as zeros after a later
    /// extension.
    pub fn truncate_block(&self, key: &Key, len: usize) {
        if let Some(mut entry) = self.map.get_mut(key) {
            if entry.data.len() > len {
                entry.data.truncate(len);
                entry.dirty = true;
            }
        }
    }

    /// Snapshot a block's payload for a bulk flush.
    pub fn dirty_payload(&self, key: &Key) -> Option<Vec<u8>> {
        self.map
            .get(key)
            .filter(|b| b.dirty)
            .map(|b| b.data.clone())
    }

    /// Clear dirty flags after a successful persist.
    pub fn mark_clean(&self, keys: &[Key]) {
        for key in keys {
            if let Some(mut entry) = self.map.get_mut(key) {
                entry.dirty = false;
            }
        }
    }

    /// Drop clean entries. Dirty blocks stay pinned until flushed.
    pub fn evict_all(&self, keys: &[Key]) {
        for key in keys {
            self.map.remove_if(key, |_, block| !block.dirty);
        }
    }

    /// Drop entries unconditionally. Only for blocks whose backing entities
    /// are being deleted (truncate, file delete).
    pub fn remove_all(&self, keys: &[Key]) {
        for key in keys {
            self.map.remove(key);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u64) -> Key {
        Key::block("/f", i)
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let cache = BlockCache::new();
        cache.write_into(key(0), 4, b"abcd");

        let mut buf = [1u8; 8];
        assert!(cache.read_into(&key(0), 0, &mut buf));
        assert_eq!(&buf, b"\0\0\0\0abcd");
        assert!(cache.is_dirty(&key(0)));
    }

    #[test]
    fn test_read_zero_fills_past_payload() {
        let cache = BlockCache::new();
        cache.insert_clean(key(0), vec![7u8; 4]);

        let mut buf = [1u8; 8];
        assert!(cache.read_into(&key(0), 2, &mut buf));
        assert_eq!(&buf, &[7, 7, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_insert_clean_never_replaces_dirty() {
        let cache = BlockCache::new();
        cache.write_into(key(0), 0, b"new");
        cache.insert_clean(key(0), b"stale".to_vec());

        let mut buf = [0u8; 3];
        cache.read_into(&key(0), 0, &mut buf);
        assert_eq!(&buf, b"new");
        assert!(cache.is_dirty(&key(0)));
    }

    #[test]
    fn test_evict_keeps_dirty_blocks() {
        let cache = BlockCache::new();
        cache.write_into(key(0), 0, b"dirty");
        cache.insert_clean(key(1), b"clean".to_vec());

        cache.evict_all(&[key(0), key(1)]);
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));

        cache.mark_clean(&[key(0)]);
        cache.evict_all(&[key(0)]);
        assert!(!cache.contains(&key(0)));
    }

    #[test]
    fn test_truncate_block_marks_dirty() {
        let cache = BlockCache::new();
        cache.insert_clean(key(0), vec![9u8; 8]);
        cache.truncate_block(&key(0), 3);

        assert!(cache.is_dirty(&key(0)));
        let mut buf = [1u8; 8];
        cache.read_into(&key(0), 0, &mut buf);
        assert_eq!(&buf, &[9, 9, 9, 0, 0, 0, 0, 0]);
    }
}
