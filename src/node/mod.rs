//! Node metadata and the `FileNode` orchestration object.
//!
//! A node is one entity in the datastore keyed by its absolute path. Files
//! additionally own an ordered run of block entities. `FileNode` carries the
//! lazily attached in-memory record and drives every namespace mutation
//! through the parent-lock discipline.

pub(crate) mod blockio;

use crate::cache::BlockCache;
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::lock::LockRegistry;
use crate::path::{self, ROOT};
use crate::store::{DatastoreClient, Entity, Key};
use blockio::BlockIo;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Filesystem node kind. Absence of a kind denotes an imaginary node: a
/// path with no metadata entity behind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Folder,
}

/// Read-side overlay of a real local directory tree. Children it reports
/// are merged into enumeration, and a local directory at an imaginary path
/// lets the engine materialise the folder on demand.
pub trait LocalOverlay: Send + Sync {
    fn is_dir(&self, path: &str) -> bool;

    /// Base names of children under `path`.
    fn list_children(&self, path: &str) -> Vec<String>;
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// Which attribute view a stat call reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrView {
    /// filetype, size, last-modified
    Basic,
    /// basic plus block-size, block-count, content-size
    Engine,
}

impl AttrView {
    /// Resolve one of the string-named views the outer adapter exposes.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "basic" => Some(AttrView::Basic),
            "kvfs" => Some(AttrView::Engine),
            _ => None,
        }
    }
}

/// Attributes of an existing node. Engine-view fields are `None` under the
/// basic view and for folders.
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub kind: FileType,
    pub size: u64,
    pub last_modified: i64,
    pub block_size: Option<u32>,
    pub block_count: Option<usize>,
    pub content_size: Option<u64>,
}

/// The persisted metadata record of one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filetype: Option<FileType>,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_keys: Vec<Key>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_keys: Vec<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(default)]
    pub content_size: u64,
}

impl NodeRecord {
    pub fn is_imaginary(&self) -> bool {
        self.filetype.is_none()
    }

    pub fn is_file(&self) -> bool {
        self.filetype == Some(FileType::File)
    }

    pub fn is_folder(&self) -> bool {
        self.filetype == Some(FileType::Folder)
    }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> FsResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Which way an open stream moves data. A writer excludes every other
/// stream; so does a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamMode {
    Read,
    Write,
}

/// Shared engine state: one instance per mounted filesystem.
pub(crate) struct Engine {
    pub(crate) store: DatastoreClient,
    pub(crate) blocks: BlockCache,
    pub(crate) locks: LockRegistry,
    pub(crate) config: FsConfig,
    pub(crate) overlay: Option<Arc<dyn LocalOverlay>>,
    pub(crate) streams: DashMap<String, StreamMode>,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Engine {
    pub(crate) async fn load_record(&self, key: &Key) -> FsResult<Option<NodeRecord>> {
        match self.store.get(key).await? {
            Some(entity) => Ok(Some(NodeRecord::decode(&entity.data)?)),
            None => Ok(None),
        }
    }

    /// Persist a record. Refreshes `last_modified` unless the caller staged
    /// an explicit value (attribute-preserving copy).
    pub(crate) async fn put_record(
        &self,
        key: &Key,
        record: &mut NodeRecord,
        refresh_mtime: bool,
    ) -> FsResult<()> {
        if refresh_mtime {
            record.last_modified = now_millis();
        }
        let entity = Entity::new(key.clone(), record.encode()?);
        self.store.put(entity).await?;
        Ok(())
    }

    /// Verify the parent of a node about to be created. The caller holds
    /// the parent lock. A missing parent backed by a local overlay
    /// directory is materialised (shadow folder), one durable put per
    /// missing ancestor, outside any transaction.
    pub(crate) async fn require_parent_folder(&self, parent_path: &str) -> FsResult<()> {
        match self.load_record(&Key::node(parent_path)).await? {
            Some(rec) if rec.is_folder() => Ok(()),
            Some(_) => Err(FsError::not_directory(parent_path)),
            None if parent_path == ROOT => Ok(()),
            None => {
                if self.overlay_is_dir(parent_path) {
                    self.materialise_folder_chain(parent_path).await
                } else {
                    Err(FsError::no_such_file(parent_path))
                }
            }
        }
    }

    fn overlay_is_dir(&self, p: &str) -> bool {
        self.overlay.as_ref().is_some_and(|o| o.is_dir(p))
    }

    /// Create folder records for every missing ancestor of `path`
    /// (inclusive), top-down.
    async fn materialise_folder_chain(&self, target: &str) -> FsResult<()> {
        let comps = path::components(target);
        let mut current = String::new();
        for comp in comps {
            let parent = if current.is_empty() {
                ROOT.to_string()
            } else {
                current.clone()
            };
            current.push('/');
            current.push_str(comp);

            let key = Key::node(&current);
            match self.load_record(&key).await? {
                Some(rec) if rec.is_folder() => continue,
                Some(_) => return Err(FsError::not_directory(current.as_str())),
                None => {
                    debug!(path = %current, "materialising shadow folder");
                    let mut rec = NodeRecord {
                        filetype: Some(FileType::Folder),
                        ..NodeRecord::default()
                    };
                    self.notify_child_added(&parent, &key).await?;
                    self.put_record(&key, &mut rec, true).await?;
                }
            }
        }
        Ok(())
    }

    /// Append `child` to the parent's child list and persist. Materialises
    /// the root record on first use. The caller holds the parent lock.
    pub(crate) async fn notify_child_added(&self, parent_path: &str, child: &Key) -> FsResult<()> {
        let parent_key = Key::node(parent_path);
        let mut rec = match self.load_record(&parent_key).await? {
            Some(rec) => {
                if rec.is_file() {
                    return Err(FsError::not_directory(parent_path));
                }
                rec
            }
            None => NodeRecord::default(),
        };
        rec.filetype = Some(FileType::Folder);
        if !rec.child_keys.contains(child) {
            rec.child_keys.push(child.clone());
        }
        self.put_record(&parent_key, &mut rec, true).await
    }

    /// Remove `child` from the parent's child list and persist. The caller
    /// holds the parent lock.
    pub(crate) async fn notify_child_removed(
        &self,
        parent_path: &str,
        child: &Key,
    ) -> FsResult<()> {
        let parent_key = Key::node(parent_path);
        if let Some(mut rec) = self.load_record(&parent_key).await? {
            rec.child_keys.retain(|k| k != child);
            self.put_record(&parent_key, &mut rec, true).await?;
        }
        Ok(())
    }

    pub(crate) fn stream_open(&self, p: &str) -> bool {
        self.streams.contains_key(p)
    }
}

/// In-memory state of one `FileNode`.
pub(crate) struct NodeState {
    /// `None` until the first attach; `Some` thereafter, imaginary or not.
    pub(crate) record: Option<NodeRecord>,
    pub(crate) meta_dirty: bool,
    pub(crate) deleted: bool,
}

/// A resolved node of the virtual filesystem.
///
/// The node is *imaginary* until `create_file`/`create_folder` materialises
/// a metadata entity, and *deleted* (terminal for this instance) after
/// `delete`; resolving the path again yields a fresh node.
pub struct FileNode {
    engine: Arc<Engine>,
    path: String,
    key: Key,
    state: Mutex<NodeState>,
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode").field("path", &self.path).finish()
    }
}

/// Options for copy operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Permit overwriting an existing destination.
    pub replace_existing: bool,
    /// Propagate `last_modified` to the destination.
    pub copy_attributes: bool,
}

impl FileNode {
    pub(crate) fn new(engine: Arc<Engine>, normalized_path: String) -> Self {
        let key = Key::node(&normalized_path);
        Self {
            engine,
            path: normalized_path,
            key,
            state: Mutex::new(NodeState {
                record: None,
                meta_dirty: false,
                deleted: false,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn is_root(&self) -> bool {
        self.path == ROOT
    }

    fn parent_path(&self) -> Option<String> {
        path::parent(&self.path)
    }

    /// Attach if needed: adopt the datastore record, or a fresh imaginary
    /// one when the entity does not exist. Idempotent and side-effect free.
    async fn ensure_attached(&self, st: &mut NodeState) -> FsResult<()> {
        if st.deleted {
            return Err(FsError::no_such_file(self.path.as_str()));
        }
        if st.record.is_none() {
            st.record = Some(
                self.engine
                    .load_record(&self.key)
                    .await?
                    .unwrap_or_default(),
            );
        }
        Ok(())
    }

    /// Re-read the record from the datastore unless local mutations are
    /// pending. Mutating operations call this inside their critical section
    /// so decisions are made against current state.
    async fn reload_if_clean(&self, st: &mut NodeState) -> FsResult<()> {
        if st.deleted {
            return Err(FsError::no_such_file(self.path.as_str()));
        }
        let has_dirty_blocks = st
            .record
            .as_ref()
            .is_some_and(|r| r.block_keys.iter().any(|k| self.engine.blocks.is_dirty(k)));
        if !st.meta_dirty && !has_dirty_blocks {
            st.record = Some(
                self.engine
                    .load_record(&self.key)
                    .await?
                    .unwrap_or_default(),
            );
        }
        Ok(())
    }

    /// Drop the in-memory record so the next access re-attaches. Refused
    /// while dirty state would be lost.
    pub async fn detach(&self) -> FsResult<()> {
        let mut st = self.state.lock().await;
        if st.deleted {
            return Ok(());
        }
        if st.meta_dirty {
            return Err(FsError::access_denied(
                self.path.as_str(),
                "detach with unflushed metadata",
            ));
        }
        if let Some(rec) = &st.record {
            if rec.block_keys.iter().any(|k| self.engine.blocks.is_dirty(k)) {
                return Err(FsError::access_denied(
                    self.path.as_str(),
                    "detach with dirty blocks",
                ));
            }
        }
        st.record = None;
        Ok(())
    }

    pub async fn exists(&self) -> FsResult<bool> {
        Ok(self.file_type().await?.is_some())
    }

    /// The node's kind, or `None` while imaginary. The root is always a
    /// folder even before its record is materialised.
    pub async fn file_type(&self) -> FsResult<Option<FileType>> {
        let mut st = self.state.lock().await;
        if st.deleted {
            return Ok(None);
        }
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let rec = st.record.as_ref().expect("attached");
        if self.is_root() {
            return Ok(Some(FileType::Folder));
        }
        Ok(rec.filetype)
    }

    /// Create a file entity at this path.
    ///
    /// Runs under the parent lock: parent existence, the own-existence
    /// check, the parent child-list update, and the metadata put form one
    /// critical section, so concurrent creators of the same path see
    /// exactly one winner.
    pub async fn create_file(&self, block_size: Option<u32>) -> FsResult<()> {
        if self.is_root() {
            return Err(FsError::already_exists(ROOT));
        }
        let block_size = match block_size {
            Some(size) => FsConfig::validate_block_size(size)?,
            None => self.engine.config.default_block_size,
        };
        let parent = self.parent_path().expect("non-root has a parent");

        let _parent_guard = self.engine.locks.lock(&parent).await;
        self.engine.require_parent_folder(&parent).await?;

        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let rec = st.record.as_mut().expect("attached");
        if !rec.is_imaginary() {
            return Err(FsError::already_exists(self.path.as_str()));
        }

        rec.filetype = Some(FileType::File);
        rec.block_size = Some(block_size);
        rec.content_size = 0;
        rec.block_keys.clear();

        self.engine.notify_child_added(&parent, &self.key).await?;
        self.engine.put_record(&self.key, rec, true).await?;
        st.meta_dirty = false;
        debug!(path = %self.path, block_size, "created file");
        Ok(())
    }

    /// Create a folder entity at this path. Same critical section shape as
    /// [`Self::create_file`].
    pub async fn create_folder(&self) -> FsResult<()> {
        if self.is_root() {
            return Err(FsError::already_exists(ROOT));
        }
        let parent = self.parent_path().expect("non-root has a parent");

        let _parent_guard = self.engine.locks.lock(&parent).await;
        self.engine.require_parent_folder(&parent).await?;

        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let rec = st.record.as_mut().expect("attached");
        if !rec.is_imaginary() {
            return Err(FsError::already_exists(self.path.as_str()));
        }

        rec.filetype = Some(FileType::Folder);
        rec.block_size = None;
        rec.content_size = 0;

        self.engine.notify_child_added(&parent, &self.key).await?;
        self.engine.put_record(&self.key, rec, true).await?;
        st.meta_dirty = false;
        debug!(path = %self.path, "created folder");
        Ok(())
    }

    /// Create this folder and any missing ancestors, top-down. An ancestor
    /// created concurrently is tolerated.
    pub async fn create_folder_all(&self) -> FsResult<()> {
        if self.is_root() {
            return Ok(());
        }
        let mut current = String::new();
        for comp in path::components(&self.path) {
            current.push('/');
            current.push_str(comp);
            let node = FileNode::new(Arc::clone(&self.engine), current.clone());
            match node.file_type().await? {
                Some(FileType::Folder) => continue,
                Some(FileType::File) => {
                    return Err(FsError::not_directory(current.as_str()));
                }
                None => match node.create_folder().await {
                    Ok(()) | Err(FsError::AlreadyExists { .. }) => {}
                    Err(err) => return Err(err),
                },
            }
        }
        Ok(())
    }

    /// Delete this node. Files lose their blocks first; folders must be
    /// empty. The terminal state sticks to this instance.
    pub async fn delete(&self) -> FsResult<()> {
        if self.is_root() {
            return Err(FsError::access_denied(ROOT, "the root cannot be deleted"));
        }
        if self.engine.stream_open(&self.path) {
            return Err(FsError::access_denied(self.path.as_str(), "stream open"));
        }
        let parent = self.parent_path().expect("non-root has a parent");

        // Child-before-parent order: own lock blocks concurrent child
        // creation under a folder while it is checked for emptiness.
        let _guards = self
            .engine
            .locks
            .lock_all(&[self.path.as_str(), parent.as_str()])
            .await;

        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");

        match rec.filetype {
            None => return Err(FsError::no_such_file(self.path.as_str())),
            Some(FileType::Folder) => {
                if !rec.child_keys.is_empty() {
                    return Err(FsError::directory_not_empty(self.path.as_str()));
                }
            }
            Some(FileType::File) => {
                let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
                io.delete_all_blocks().await?;
            }
        }

        self.engine.notify_child_removed(&parent, &self.key).await?;
        self.engine.store.delete(&self.key).await?;
        st.deleted = true;
        st.meta_dirty = false;
        debug!(path = %self.path, "deleted node");
        Ok(())
    }

    /// Move this node to `dest` by copy-then-delete. The datastore forbids
    /// key mutation, so there is no atomic variant; folders must be empty
    /// (callers recurse child-first).
    pub async fn rename_to(&self, dest: &FileNode, replace_existing: bool) -> FsResult<()> {
        if !Arc::ptr_eq(&self.engine, &dest.engine) {
            return Err(FsError::ProviderMismatch {
                path: Some(dest.path.clone()),
            });
        }
        if self.is_root() || dest.is_root() {
            return Err(FsError::access_denied(ROOT, "the root cannot be renamed"));
        }
        if self.path == dest.path {
            return Ok(());
        }
        if self.engine.stream_open(&self.path) || self.engine.stream_open(&dest.path) {
            return Err(FsError::access_denied(self.path.as_str(), "stream open"));
        }

        let src_parent = self.parent_path().expect("non-root has a parent");
        let dst_parent = dest.parent_path().expect("non-root has a parent");
        let _guards = self
            .engine
            .locks
            .lock_all(&[
                self.path.as_str(),
                dest.path.as_str(),
                src_parent.as_str(),
                dst_parent.as_str(),
            ])
            .await;

        let (src_rec, payloads) = self.snapshot_content().await?;
        if src_rec.is_folder() && !src_rec.child_keys.is_empty() {
            return Err(FsError::directory_not_empty(self.path.as_str()));
        }

        dest.materialise_from(&src_rec, payloads, &dst_parent, replace_existing, true)
            .await?;
        self.delete_in_section(&src_parent).await?;
        debug!(from = %self.path, to = %dest.path, "moved node");
        Ok(())
    }

    /// Copy this node to `dest`. Folders copy as a fresh empty folder;
    /// files copy block payloads byte-for-byte.
    pub async fn copy_to(&self, dest: &FileNode, opts: &CopyOptions) -> FsResult<()> {
        if !Arc::ptr_eq(&self.engine, &dest.engine) {
            return Err(FsError::ProviderMismatch {
                path: Some(dest.path.clone()),
            });
        }
        if dest.is_root() {
            return Err(FsError::already_exists(ROOT));
        }
        if self.path == dest.path {
            return Ok(());
        }
        if self.engine.stream_open(&dest.path) {
            return Err(FsError::access_denied(dest.path.as_str(), "stream open"));
        }

        let dst_parent = dest.parent_path().expect("non-root has a parent");
        let _guards = self
            .engine
            .locks
            .lock_all(&[dest.path.as_str(), dst_parent.as_str()])
            .await;

        let (src_rec, payloads) = self.snapshot_content().await?;
        dest.materialise_from(
            &src_rec,
            payloads,
            &dst_parent,
            opts.replace_existing,
            opts.copy_attributes,
        )
        .await?;
        debug!(from = %self.path, to = %dest.path, "copied node");
        Ok(())
    }

    /// Read the source record and, for files, every block payload. Runs
    /// before the destination is touched so no two node states are held at
    /// once.
    async fn snapshot_content(&self) -> FsResult<(NodeRecord, Vec<Vec<u8>>)> {
        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        if rec.is_imaginary() {
            return Err(FsError::no_such_file(self.path.as_str()));
        }
        if rec.is_folder() {
            return Ok((rec.clone(), Vec::new()));
        }

        let block_size = rec.block_size.unwrap_or(self.engine.config.default_block_size) as u64;
        let content_size = rec.content_size;
        let snapshot = rec.clone();
        let mut payloads = Vec::with_capacity(snapshot.block_keys.len());
        let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
        let mut offset = 0u64;
        while offset < content_size {
            let take = ((content_size - offset).min(block_size)) as usize;
            let mut buf = vec![0u8; take];
            io.read_at(offset, &mut buf).await?;
            payloads.push(buf);
            offset += take as u64;
        }
        Ok((snapshot, payloads))
    }

    /// Build this node from a source snapshot: metadata properties minus
    /// the block list, plus freshly keyed dirty blocks, then one flush.
    /// The caller holds this node's and its parent's locks.
    async fn materialise_from(
        &self,
        src: &NodeRecord,
        payloads: Vec<Vec<u8>>,
        parent: &str,
        replace_existing: bool,
        copy_attributes: bool,
    ) -> FsResult<()> {
        self.engine.require_parent_folder(parent).await?;

        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        {
            let state = &mut *st;
            let rec = state.record.as_mut().expect("attached");
            if !rec.is_imaginary() {
                if !replace_existing {
                    return Err(FsError::already_exists(self.path.as_str()));
                }
                if rec.is_folder() && !rec.child_keys.is_empty() {
                    return Err(FsError::directory_not_empty(self.path.as_str()));
                }
                if rec.is_file() {
                    let mut io =
                        BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
                    io.delete_all_blocks().await?;
                }
            }
        }

        let rec = st.record.as_mut().expect("attached");
        *rec = NodeRecord {
            filetype: src.filetype,
            last_modified: src.last_modified,
            child_keys: Vec::new(),
            block_keys: Vec::new(),
            block_size: src.block_size,
            content_size: src.content_size,
        };

        if rec.is_folder() {
            self.engine.notify_child_added(parent, &self.key).await?;
            self.engine
                .put_record(&self.key, rec, !copy_attributes)
                .await?;
            st.meta_dirty = false;
            return Ok(());
        }

        for (index, payload) in payloads.iter().enumerate() {
            let block_key = Key::block(&self.path, index as u64);
            self.engine.blocks.write_into(block_key.clone(), 0, payload);
            rec.block_keys.push(block_key);
        }
        st.meta_dirty = true;

        self.engine.notify_child_added(parent, &self.key).await?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
        io.flush(!copy_attributes).await
    }

    /// Delete while already holding the namespace locks (rename tail).
    async fn delete_in_section(&self, parent: &str) -> FsResult<()> {
        let mut st = self.state.lock().await;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        if rec.is_file() {
            let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
            io.delete_all_blocks().await?;
        }
        self.engine.notify_child_removed(parent, &self.key).await?;
        self.engine.store.delete(&self.key).await?;
        st.deleted = true;
        st.meta_dirty = false;
        Ok(())
    }

    /// Enumerate immediate children: the record's child list merged with
    /// whatever the local overlay reports.
    pub async fn list_children(&self) -> FsResult<Vec<DirEntry>> {
        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let rec = st.record.as_ref().expect("attached");

        if rec.is_file() {
            return Err(FsError::not_directory(self.path.as_str()));
        }
        if rec.is_imaginary() && !self.is_root() && !self.engine.overlay_is_dir(&self.path) {
            return Err(FsError::no_such_file(self.path.as_str()));
        }

        let child_keys = rec.child_keys.clone();
        drop(st);

        let records = self.engine.store.get_many(&child_keys).await?;
        let mut entries = Vec::with_capacity(child_keys.len());
        for key in &child_keys {
            let Some(entity) = records.get(key) else {
                continue;
            };
            let child = NodeRecord::decode(&entity.data)?;
            let Some(kind) = child.filetype else {
                continue;
            };
            let child_path = key.as_str().trim_start_matches("n:");
            entries.push(DirEntry {
                name: path::base_name(child_path).to_string(),
                kind,
            });
        }

        if let Some(overlay) = &self.engine.overlay {
            for name in overlay.list_children(&self.path) {
                if entries.iter().any(|e| e.name == name) {
                    continue;
                }
                let child_path = path::resolve(&self.path, &name)?;
                let kind = if overlay.is_dir(&child_path) {
                    FileType::Folder
                } else {
                    FileType::File
                };
                entries.push(DirEntry { name, kind });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Read attributes under the requested view.
    pub async fn attributes(&self, view: AttrView) -> FsResult<FileAttributes> {
        let mut st = self.state.lock().await;
        self.reload_if_clean(&mut st).await?;
        self.ensure_attached(&mut st).await?;
        let rec = st.record.as_ref().expect("attached");

        let kind = if self.is_root() {
            FileType::Folder
        } else {
            rec.filetype
                .ok_or_else(|| FsError::no_such_file(self.path.as_str()))?
        };

        let mut attrs = FileAttributes {
            kind,
            size: rec.content_size,
            last_modified: rec.last_modified,
            block_size: None,
            block_count: None,
            content_size: None,
        };
        if view == AttrView::Engine && kind == FileType::File {
            attrs.block_size = rec.block_size;
            attrs.block_count = Some(rec.block_keys.len());
            attrs.content_size = Some(rec.content_size);
        }
        Ok(attrs)
    }

    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let mut st = self.state.lock().await;
        self.ensure_attached(&mut st).await?;
        self.require_file(&st)?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
        io.read_at(offset, buf).await
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> FsResult<()> {
        let mut st = self.state.lock().await;
        self.ensure_attached(&mut st).await?;
        self.require_file(&st)?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
        io.write_at(offset, data).await
    }

    pub async fn truncate(&self, len: u64) -> FsResult<()> {
        let mut st = self.state.lock().await;
        self.ensure_attached(&mut st).await?;
        self.require_file(&st)?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
        io.truncate(len).await
    }

    /// Persist dirty blocks and metadata in bulk slices.
    pub async fn flush(&self) -> FsResult<()> {
        let mut st = self.state.lock().await;
        self.ensure_attached(&mut st).await?;
        self.require_file(&st)?;
        let state = &mut *st;
        let rec = state.record.as_mut().expect("attached");
        let mut io = BlockIo::new(&self.engine, &self.path, rec, &mut state.meta_dirty);
        io.flush(true).await
    }

    /// Current logical length as seen by this node instance.
    pub async fn content_size(&self) -> FsResult<u64> {
        let mut st = self.state.lock().await;
        self.ensure_attached(&mut st).await?;
        Ok(st.record.as_ref().expect("attached").content_size)
    }

    /// Drop this file's clean blocks from the process cache (stream close).
    pub(crate) async fn evict_blocks(&self) {
        let st = self.state.lock().await;
        if let Some(rec) = &st.record {
            self.engine.blocks.evict_all(&rec.block_keys);
        }
    }

    fn require_file(&self, st: &NodeState) -> FsResult<()> {
        let rec = st.record.as_ref().expect("attached");
        match rec.filetype {
            Some(FileType::File) => Ok(()),
            Some(FileType::Folder) => Err(FsError::access_denied(
                self.path.as_str(),
                "content operations on a folder",
            )),
            None => Err(FsError::no_such_file(self.path.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding_omits_empty_lists() {
        let rec = NodeRecord {
            filetype: Some(FileType::Folder),
            last_modified: 1,
            ..NodeRecord::default()
        };
        let json = String::from_utf8(rec.encode().unwrap()).unwrap();
        assert!(!json.contains("child_keys"));
        assert!(!json.contains("block_keys"));
        assert!(!json.contains("block_size"));
    }

    #[test]
    fn test_record_decode_defaults() {
        let rec = NodeRecord::decode(b"{}").unwrap();
        assert!(rec.is_imaginary());
        assert_eq!(rec.content_size, 0);
        assert!(rec.child_keys.is_empty());
    }

    #[test]
    fn test_attr_view_names() {
        assert_eq!(AttrView::named("basic"), Some(AttrView::Basic));
        assert_eq!(AttrView::named("kvfs"), Some(AttrView::Engine));
        assert_eq!(AttrView::named("posix"), None);
    }

    #[test]
    fn test_record_round_trip() {
        let rec = NodeRecord {
            filetype: Some(FileType::File),
            last_modified: 42,
            child_keys: Vec::new(),
            block_keys: vec![Key::block("/f", 0), Key::block("/f", 1)],
            block_size: Some(8192),
            content_size: 12000,
        };
        let back = NodeRecord::decode(&rec.encode().unwrap()).unwrap();
        assert!(back.is_file());
        assert_eq!(back.block_keys.len(), 2);
        assert_eq!(back.block_size, Some(8192));
        assert_eq!(back.content_size, 12000);
    }
}
