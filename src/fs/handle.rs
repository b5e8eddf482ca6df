//! Positional stream handle over one file.
//!
//! A handle owns the file's single stream slot: while it is open no other
//! reader or writer can open the same file. `close` flushes writers, drops
//! the file's clean blocks from the process cache, and frees the slot; a
//! handle dropped without `close` frees the slot but leaves dirty blocks
//! cached for a later flush.

use crate::error::{FsError, FsResult};
use crate::node::FileNode;

#[derive(Debug)]
pub struct FileHandle {
    node: FileNode,
    read: bool,
    write: bool,
    append: bool,
    pos: u64,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(node: FileNode, read: bool, write: bool, append: bool, pos: u64) -> Self {
        Self {
            node,
            read,
            write,
            append,
            pos,
            closed: false,
        }
    }

    pub fn path(&self) -> &str {
        self.node.path()
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Move the read/write position. Append-mode writes ignore it.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub async fn size(&self) -> FsResult<u64> {
        self.node.content_size().await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.read {
            return Err(FsError::access_denied(self.path(), "handle not open for read"));
        }
        let n = self.node.read_at(self.pos, buf).await?;
        self.pos += n as u64;
        Ok(n)
    }

    pub async fn read_to_end(&mut self) -> FsResult<Vec<u8>> {
        let size = self.node.content_size().await?;
        let remaining = size.saturating_sub(self.pos) as usize;
        let mut out = vec![0u8; remaining];
        let mut filled = 0;
        while filled < remaining {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    pub async fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        if !self.write {
            return Err(FsError::access_denied(
                self.path(),
                "handle not open for write",
            ));
        }
        if self.append {
            self.pos = self.node.content_size().await?;
        }
        self.node.write_at(self.pos, data).await?;
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> FsResult<()> {
        self.write(data).await.map(|_| ())
    }

    pub async fn truncate(&mut self, len: u64) -> FsResult<()> {
        if !self.write {
            return Err(FsError::access_denied(
                self.path(),
                "handle not open for write",
            ));
        }
        self.node.truncate(len).await
    }

    /// Persist dirty blocks and metadata now, without closing.
    pub async fn flush(&self) -> FsResult<()> {
        if self.write {
            self.node.flush().await?;
        }
        Ok(())
    }

    /// Flush (writers), evict this file's clean blocks, and free the
    /// stream slot.
    pub async fn close(mut self) -> FsResult<()> {
        if self.write {
            self.node.flush().await?;
        }
        self.node.evict_blocks().await;
        self.release_slot();
        Ok(())
    }

    fn release_slot(&mut self) {
        if !self.closed {
            self.closed = true;
            self.node.engine().streams.remove(self.node.path());
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.release_slot();
    }
}
