//! Positional block IO over one file's block sequence.
//!
//! Translates byte offsets into (block index, intra-block offset) spans,
//! keeps reads warm through the block cache with forward-window bulk
//! fetches, and persists dirty blocks in bulk slices sized against the
//! platform limits.

use super::{Engine, FileType, NodeRecord};
use crate::error::{FsError, FsResult};
use crate::store::{Entity, Key, max_entities_per_bulk};
use tracing::debug;

pub(crate) struct BlockIo<'a> {
    engine: &'a Engine,
    path: &'a str,
    record: &'a mut NodeRecord,
    meta_dirty: &'a mut bool,
}

impl<'a> BlockIo<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        path: &'a str,
        record: &'a mut NodeRecord,
        meta_dirty: &'a mut bool,
    ) -> Self {
        Self {
            engine,
            path,
            record,
            meta_dirty,
        }
    }

    fn block_size(&self) -> u64 {
        self.record
            .block_size
            .unwrap_or(self.engine.config.default_block_size) as u64
    }

    /// Largest block count per bulk round trip for this file's block size.
    fn max_blocks_per_bulk(&self) -> usize {
        max_entities_per_bulk(self.block_size() as usize)
    }

    /// Pull a forward window of blocks starting at `start` into the cache.
    /// Keys whose entities are missing simply stay uncached and read as
    /// zeros.
    async fn fetch_window(&mut self, start: usize) -> FsResult<()> {
        let end = (start + self.max_blocks_per_bulk()).min(self.record.block_keys.len());
        let wanted: Vec<Key> = self.record.block_keys[start..end]
            .iter()
            .filter(|k| !self.engine.blocks.contains(k))
            .cloned()
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }
        debug!(path = self.path, blocks = wanted.len(), "bulk block fetch");
        let fetched = self.engine.store.get_many(&wanted).await?;
        for (key, entity) in fetched {
            self.engine.blocks.insert_clean(key, entity.data.to_vec());
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the content
    /// size. Holes (unallocated or unwritten blocks) read as zeros.
    pub(crate) async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let size = self.record.content_size;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - offset) as usize;
        let bs = self.block_size();

        let mut done = 0usize;
        while done < n {
            let pos = offset + done as u64;
            let index = (pos / bs) as usize;
            let in_off = (pos % bs) as usize;
            let take = ((bs as usize) - in_off).min(n - done);
            let dst = &mut buf[done..done + take];

            if index >= self.record.block_keys.len() {
                dst.fill(0);
                done += take;
                continue;
            }
            let key = self.record.block_keys[index].clone();
            if !self.engine.blocks.contains(&key) {
                self.fetch_window(index).await?;
            }
            if !self.engine.blocks.read_into(&key, in_off, dst) {
                dst.fill(0);
            }
            done += take;
        }
        Ok(n)
    }

    /// Write `data` at `offset`, allocating blocks as needed. Intermediate
    /// blocks between the old end and the write position materialise as
    /// zero-padded entities. Touched blocks go dirty; the metadata follows
    /// once `content_size` grows.
    pub(crate) async fn write_at(&mut self, offset: u64, data: &[u8]) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let bs = self.block_size();
        let end = offset + data.len() as u64;
        let last_index = ((end - 1) / bs) as usize;

        while self.record.block_keys.len() <= last_index {
            let index = self.record.block_keys.len() as u64;
            let key = Key::block(self.path, index);
            // New blocks below the write span persist as zero payloads.
            self.engine.blocks.write_into(key.clone(), 0, &[]);
            self.record.block_keys.push(key);
        }

        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let index = (pos / bs) as usize;
            let in_off = (pos % bs) as usize;
            let take = ((bs as usize) - in_off).min(data.len() - done);

            let key = self.record.block_keys[index].clone();
            // Partial overwrite of a block that may already be persisted:
            // read-modify-write, so pull it into the cache first.
            let full_block = in_off == 0 && take == bs as usize;
            if !full_block && !self.engine.blocks.contains(&key) {
                self.fetch_window(index).await?;
            }
            self.engine
                .blocks
                .write_into(key, in_off, &data[done..done + take]);
            done += take;
        }

        if end > self.record.content_size {
            self.record.content_size = end;
        }
        *self.meta_dirty = true;
        Ok(())
    }

    /// Truncate to `len` bytes. Dropped blocks are deleted durably and
    /// removed from the cache; the kept boundary block is zero-trimmed so a
    /// later extension reads zeros, not stale bytes. Truncating to the
    /// current size is a no-op; growing only moves `content_size`.
    pub(crate) async fn truncate(&mut self, len: u64) -> FsResult<()> {
        let size = self.record.content_size;
        if len == size {
            return Ok(());
        }
        if len > size {
            self.record.content_size = len;
            *self.meta_dirty = true;
            return Ok(());
        }

        let bs = self.block_size();
        let keep = (len.div_ceil(bs)) as usize;
        if keep < self.record.block_keys.len() {
            let dropped = self.record.block_keys.split_off(keep);
            self.engine.store.delete_many(&dropped).await?;
            self.engine.blocks.remove_all(&dropped);
        }

        let tail = (len % bs) as usize;
        if keep > 0 && tail != 0 {
            let key = self.record.block_keys[keep - 1].clone();
            if !self.engine.blocks.contains(&key) {
                self.fetch_window(keep - 1).await?;
            }
            self.engine.blocks.truncate_block(&key, tail);
        }

        self.record.content_size = len;
        *self.meta_dirty = true;
        debug!(path = self.path, len, "truncated");
        Ok(())
    }

    /// Remove every block entity of this file (delete, replace).
    pub(crate) async fn delete_all_blocks(&mut self) -> FsResult<()> {
        let dropped = std::mem::take(&mut self.record.block_keys);
        if !dropped.is_empty() {
            self.engine.store.delete_many(&dropped).await?;
            self.engine.blocks.remove_all(&dropped);
        }
        self.record.content_size = 0;
        Ok(())
    }

    /// Persist dirty state: refreshed metadata first, then dirty blocks in
    /// offset order, sliced to the bulk ceiling. In write-through mode the
    /// whole batch commits inside one transaction; otherwise each slice
    /// that lands clears its blocks' dirty flags, and a mid-flight failure
    /// leaves the rest dirty for a retry.
    pub(crate) async fn flush(&mut self, refresh_mtime: bool) -> FsResult<()> {
        let dirty_keys: Vec<Key> = self
            .record
            .block_keys
            .iter()
            .filter(|k| self.engine.blocks.is_dirty(k))
            .cloned()
            .collect();
        if dirty_keys.is_empty() && !*self.meta_dirty {
            return Ok(());
        }

        // An imaginary node reaching a flush has become a file by writing.
        self.record.filetype = Some(FileType::File);
        if refresh_mtime {
            self.record.last_modified = super::now_millis();
        }

        let node_key = Key::node(self.path);
        let mut entities = Vec::with_capacity(dirty_keys.len() + 1);
        entities.push(Entity::new(node_key.clone(), self.record.encode()?));
        for key in &dirty_keys {
            let payload = self.engine.blocks.dirty_payload(key).unwrap_or_default();
            entities.push(Entity::new(key.clone(), payload));
        }

        let max_per_bulk = self.max_blocks_per_bulk();
        debug!(
            path = self.path,
            blocks = dirty_keys.len(),
            slices = entities.len().div_ceil(max_per_bulk),
            "flush"
        );

        if self.engine.config.write_through {
            let mut tx = self.engine.store.begin_tx().await?;
            for slice in entities.chunks(max_per_bulk) {
                if let Err(err) = tx.put_many(slice.to_vec()).await {
                    let _ = tx.rollback().await;
                    return Err(FsError::Io(err));
                }
            }
            tx.commit().await?;
            self.engine.blocks.mark_clean(&dirty_keys);
            *self.meta_dirty = false;
        } else {
            for slice in entities.chunks(max_per_bulk) {
                self.engine.store.put_many(slice.to_vec()).await?;
                for entity in slice {
                    if entity.key == node_key {
                        *self.meta_dirty = false;
                    } else {
                        self.engine.blocks.mark_clean(std::slice::from_ref(&entity.key));
                    }
                }
            }
        }
        Ok(())
    }
}
