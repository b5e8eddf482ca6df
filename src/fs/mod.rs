//! Path-based filesystem surface over the storage engine.
//!
//! `KvFs` owns one engine instance (datastore client, block cache, lock
//! registry) and exposes std-like operations: open with options, directory
//! create/remove, rename and copy, enumeration, and attribute views.

mod handle;

pub use handle::FileHandle;

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::node::{
    AttrView, CopyOptions, DirEntry, Engine, FileAttributes, FileNode, LocalOverlay, StreamMode,
};
use crate::path;
use crate::store::{Datastore, DatastoreClient};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Requested access kind for permission checks. Execute is never granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

/// Options for move operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
    /// Permit overwriting an existing destination.
    pub replace_existing: bool,
    /// Request an atomic move. The datastore forbids key mutation, so this
    /// always fails.
    pub atomic_move: bool,
}

/// Builder for opening a file stream, in the std `OpenOptions` manner.
///
/// With none of `write`/`append` set the stream opens read-only. `append`
/// implies write and is incompatible with `read` and `truncate`.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
    sync: bool,
    dsync: bool,
    sparse: bool,
    delete_on_close: bool,
    block_size: Option<u32>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, v: bool) -> &mut Self {
        self.read = v;
        self
    }

    pub fn write(&mut self, v: bool) -> &mut Self {
        self.write = v;
        self
    }

    pub fn append(&mut self, v: bool) -> &mut Self {
        self.append = v;
        self
    }

    /// Create the file if absent; an existing file is tolerated.
    pub fn create(&mut self, v: bool) -> &mut Self {
        self.create = v;
        self
    }

    /// Require creation; fail if the file already exists.
    pub fn create_new(&mut self, v: bool) -> &mut Self {
        self.create_new = v;
        self
    }

    /// Truncate to zero length on open-for-write.
    pub fn truncate(&mut self, v: bool) -> &mut Self {
        self.truncate = v;
        self
    }

    /// Block size for a file this open creates. Immutable after creation.
    pub fn block_size(&mut self, size: u32) -> &mut Self {
        self.block_size = Some(size);
        self
    }

    pub fn sync(&mut self, v: bool) -> &mut Self {
        self.sync = v;
        self
    }

    pub fn dsync(&mut self, v: bool) -> &mut Self {
        self.dsync = v;
        self
    }

    pub fn sparse(&mut self, v: bool) -> &mut Self {
        self.sparse = v;
        self
    }

    pub fn delete_on_close(&mut self, v: bool) -> &mut Self {
        self.delete_on_close = v;
        self
    }

    fn validate(&self) -> FsResult<(bool, bool)> {
        for (set, name) in [
            (self.sync, "SYNC"),
            (self.dsync, "DSYNC"),
            (self.sparse, "SPARSE"),
            (self.delete_on_close, "DELETE_ON_CLOSE"),
        ] {
            if set {
                return Err(FsError::unsupported_option(name));
            }
        }
        if self.append && self.read {
            return Err(FsError::unsupported_option("APPEND with READ"));
        }
        if self.append && self.truncate {
            return Err(FsError::unsupported_option(
                "APPEND with TRUNCATE_EXISTING",
            ));
        }
        let write = self.write || self.append;
        let read = self.read || !write;
        Ok((read, write))
    }
}

/// The filesystem instance: one engine over one backing datastore.
#[derive(Clone)]
pub struct KvFs {
    engine: Arc<Engine>,
}

impl KvFs {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self::with_config(store, FsConfig::default())
    }

    pub fn with_config(store: Arc<dyn Datastore>, config: FsConfig) -> Self {
        Self::build(store, config, None)
    }

    /// Attach a read-side overlay of a local directory tree: its children
    /// join enumeration, and folders it reports can be materialised on
    /// demand.
    pub fn with_overlay(
        store: Arc<dyn Datastore>,
        config: FsConfig,
        overlay: Arc<dyn LocalOverlay>,
    ) -> Self {
        Self::build(store, config, Some(overlay))
    }

    fn build(
        store: Arc<dyn Datastore>,
        config: FsConfig,
        overlay: Option<Arc<dyn LocalOverlay>>,
    ) -> Self {
        let client = DatastoreClient::new(store, &config.memcache);
        Self {
            engine: Arc::new(Engine {
                store: client,
                blocks: crate::cache::BlockCache::new(),
                locks: crate::lock::LockRegistry::new(),
                config,
                overlay,
                streams: DashMap::new(),
            }),
        }
    }

    /// Resolve a path into a node. The node attaches lazily on first use.
    pub fn resolve(&self, raw: &str) -> FsResult<FileNode> {
        let normalized = path::normalize(raw)?;
        Ok(FileNode::new(Arc::clone(&self.engine), normalized))
    }

    /// Whether two raw paths name the same node.
    pub fn same_file(&self, a: &str, b: &str) -> FsResult<bool> {
        Ok(path::normalize(a)? == path::normalize(b)?)
    }

    /// Open a file stream. At most one stream per file may be open at a
    /// time; a second open fails while the first holds the slot.
    ///
    /// Creation runs under the parent lock before the stream slot is
    /// claimed, so concurrent `CREATE_NEW` openers race on the entity, not
    /// the slot: exactly one wins, the rest see `AlreadyExists`.
    pub async fn open(&self, raw: &str, opts: &OpenOptions) -> FsResult<FileHandle> {
        use crate::node::FileType;

        let (read, write) = opts.validate()?;
        let node = self.resolve(raw)?;

        match node.file_type().await? {
            Some(FileType::Folder) => {
                return Err(FsError::access_denied(node.path(), "cannot open a folder"));
            }
            Some(FileType::File) => {
                if write && opts.create_new {
                    return Err(FsError::already_exists(node.path()));
                }
            }
            None => {
                if write && (opts.create || opts.create_new) {
                    match node.create_file(opts.block_size).await {
                        Ok(()) => {}
                        // CREATE tolerates losing a creation race.
                        Err(FsError::AlreadyExists { .. }) if !opts.create_new => {}
                        Err(err) => return Err(err),
                    }
                } else {
                    return Err(FsError::no_such_file(node.path()));
                }
            }
        }

        let mode = if write {
            StreamMode::Write
        } else {
            StreamMode::Read
        };
        match self.engine.streams.entry(node.path().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(FsError::access_denied(node.path(), "stream already open"));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(mode);
            }
        }

        let path = node.path().to_string();
        let prepared: FsResult<u64> = async {
            if write && opts.truncate {
                node.truncate(0).await?;
            }
            if opts.append {
                node.content_size().await
            } else {
                Ok(0)
            }
        }
        .await;

        match prepared {
            Ok(pos) => {
                debug!(path = %path, read, write, "opened stream");
                Ok(FileHandle::new(node, read, write, opts.append, pos))
            }
            Err(err) => {
                self.engine.streams.remove(&path);
                Err(err)
            }
        }
    }

    /// Create a single folder; the parent must already exist.
    pub async fn create_dir(&self, raw: &str) -> FsResult<()> {
        self.resolve(raw)?.create_folder().await
    }

    /// Create a folder and any missing ancestors.
    pub async fn create_dir_all(&self, raw: &str) -> FsResult<()> {
        self.resolve(raw)?.create_folder_all().await
    }

    /// Delete a file or an empty folder.
    pub async fn remove(&self, raw: &str) -> FsResult<()> {
        self.resolve(raw)?.delete().await
    }

    /// Move a node. Always copy-then-delete: requesting an atomic move
    /// fails up front and leaves both paths untouched.
    pub async fn rename(&self, from: &str, to: &str, opts: &MoveOptions) -> FsResult<()> {
        if opts.atomic_move {
            return Err(FsError::AtomicMoveNotSupported {
                path: Some(path::normalize(from)?),
            });
        }
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        src.rename_to(&dst, opts.replace_existing).await
    }

    /// Copy a node. Folders copy as a fresh empty folder.
    pub async fn copy(&self, from: &str, to: &str, opts: &CopyOptions) -> FsResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        src.copy_to(&dst, opts).await
    }

    /// Enumerate a folder's children.
    pub async fn read_dir(&self, raw: &str) -> FsResult<Vec<DirEntry>> {
        self.resolve(raw)?.list_children().await
    }

    /// Basic attribute view: filetype, size, last-modified.
    pub async fn metadata(&self, raw: &str) -> FsResult<FileAttributes> {
        self.resolve(raw)?.attributes(AttrView::Basic).await
    }

    /// Named attribute view; the engine view adds block accounting.
    pub async fn metadata_view(&self, raw: &str, view: AttrView) -> FsResult<FileAttributes> {
        self.resolve(raw)?.attributes(view).await
    }

    pub async fn exists(&self, raw: &str) -> FsResult<bool> {
        self.resolve(raw)?.exists().await
    }

    /// Check the requested access kinds against the node. Existence is
    /// checked first; execute access is never permitted by the engine.
    pub async fn check_access(&self, raw: &str, modes: &[AccessMode]) -> FsResult<()> {
        let node = self.resolve(raw)?;
        if !node.exists().await? {
            return Err(FsError::no_such_file(node.path()));
        }
        if modes.contains(&AccessMode::Execute) {
            return Err(FsError::access_denied(node.path(), "execute is never permitted"));
        }
        Ok(())
    }

    /// Read a whole file, the short way.
    pub async fn read(&self, raw: &str) -> FsResult<Vec<u8>> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        let mut handle = self.open(raw, &opts).await?;
        let data = handle.read_to_end().await?;
        handle.close().await?;
        Ok(data)
    }

    /// Create or replace a whole file, the short way.
    pub async fn write(&self, raw: &str, data: &[u8]) -> FsResult<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        let mut handle = self.open(raw, &opts).await?;
        handle.write_all(data).await?;
        handle.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FileType;
    use crate::store::MemoryDatastore;

    fn fs() -> KvFs {
        KvFs::new(Arc::new(MemoryDatastore::new()))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let fs = fs();
        fs.create_dir("/a").await.unwrap();

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).block_size(8192);
        let mut handle = fs.open("/a/b.txt", &opts).await.unwrap();
        handle.write_all(&pattern(12000)).await.unwrap();
        handle.close().await.unwrap();

        let data = fs.read("/a/b.txt").await.unwrap();
        assert_eq!(data, pattern(12000));

        let attrs = fs
            .metadata_view("/a/b.txt", AttrView::Engine)
            .await
            .unwrap();
        assert_eq!(attrs.kind, FileType::File);
        assert_eq!(attrs.size, 12000);
        assert_eq!(attrs.block_size, Some(8192));
        assert_eq!(attrs.block_count, Some(2));
        assert_eq!(attrs.content_size, Some(12000));
        assert!(attrs.last_modified > 0);
    }

    #[tokio::test]
    async fn test_open_missing_without_create_fails() {
        let fs = fs();
        let mut opts = OpenOptions::new();
        opts.read(true);
        let err = fs.open("/nope", &opts).await.unwrap_err();
        assert!(matches!(err, FsError::NoSuchFile { .. }));
    }

    #[tokio::test]
    async fn test_create_new_requires_absence() {
        let fs = fs();
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        fs.open("/f", &opts).await.unwrap().close().await.unwrap();

        let err = fs.open("/f", &opts).await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_options_are_refused() {
        let fs = fs();
        let cases: [fn(&mut OpenOptions); 6] = [
            |o| {
                o.sync(true);
            },
            |o| {
                o.dsync(true);
            },
            |o| {
                o.sparse(true);
            },
            |o| {
                o.delete_on_close(true);
            },
            |o| {
                o.append(true).read(true);
            },
            |o| {
                o.append(true).truncate(true);
            },
        ];
        for set in cases {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true);
            set(&mut opts);
            let err = fs.open("/u", &opts).await.unwrap_err();
            assert!(matches!(err, FsError::UnsupportedOption { .. }));
        }
    }

    #[tokio::test]
    async fn test_append_positions_at_content_size() {
        let fs = fs();
        fs.write("/log", b"one").await.unwrap();

        let mut opts = OpenOptions::new();
        opts.append(true);
        let mut handle = fs.open("/log", &opts).await.unwrap();
        handle.write_all(b"two").await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(fs.read("/log").await.unwrap(), b"onetwo");
    }

    #[tokio::test]
    async fn test_truncate_existing_on_open() {
        let fs = fs();
        fs.write("/t", b"longer content").await.unwrap();

        let mut opts = OpenOptions::new();
        opts.write(true).truncate(true);
        let mut handle = fs.open("/t", &opts).await.unwrap();
        handle.write_all(b"new").await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(fs.read("/t").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_single_stream_per_file() {
        let fs = fs();
        fs.write("/s", b"data").await.unwrap();

        let mut read_opts = OpenOptions::new();
        read_opts.read(true);
        let first = fs.open("/s", &read_opts).await.unwrap();

        let err = fs.open("/s", &read_opts).await.unwrap_err();
        assert!(matches!(err, FsError::AccessDenied { .. }));

        first.close().await.unwrap();
        fs.open("/s", &read_opts)
            .await
            .unwrap()
            .close()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rename_of_open_file_fails() {
        let fs = fs();
        fs.write("/open", b"x").await.unwrap();
        let mut opts = OpenOptions::new();
        opts.read(true);
        let handle = fs.open("/open", &opts).await.unwrap();

        let err = fs
            .rename("/open", "/elsewhere", &MoveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::AccessDenied { .. }));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_enumeration() {
        let fs = fs();
        fs.create_dir("/d").await.unwrap();
        for name in ["x", "y", "z"] {
            fs.write(&format!("/d/{name}"), b"1").await.unwrap();
        }

        let names: Vec<String> = fs
            .read_dir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["x", "y", "z"]);

        fs.remove("/d/y").await.unwrap();
        let names: Vec<String> = fs
            .read_dir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["x", "z"]);
    }

    #[tokio::test]
    async fn test_remove_non_empty_folder_fails() {
        let fs = fs();
        fs.create_dir("/d").await.unwrap();
        fs.write("/d/f", b"1").await.unwrap();

        let err = fs.remove("/d").await.unwrap_err();
        assert!(matches!(err, FsError::DirectoryNotEmpty { .. }));

        fs.remove("/d/f").await.unwrap();
        fs.remove("/d").await.unwrap();
        assert!(!fs.exists("/d").await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_move_is_refused() {
        let fs = fs();
        fs.write("/src", b"hello").await.unwrap();

        let opts = MoveOptions {
            atomic_move: true,
            ..MoveOptions::default()
        };
        let err = fs.rename("/src", "/dst", &opts).await.unwrap_err();
        assert!(matches!(err, FsError::AtomicMoveNotSupported { .. }));
        assert!(fs.exists("/src").await.unwrap());
        assert!(!fs.exists("/dst").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_file() {
        let fs = fs();
        fs.create_dir("/src").await.unwrap();
        fs.create_dir("/dst").await.unwrap();
        fs.write("/src/f", b"hello").await.unwrap();

        fs.rename("/src/f", "/dst/f", &MoveOptions::default())
            .await
            .unwrap();

        assert!(!fs.exists("/src/f").await.unwrap());
        assert_eq!(fs.read("/dst/f").await.unwrap(), b"hello");
        assert_eq!(fs.metadata("/dst/f").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_copy_preserves_source() {
        let fs = fs();
        fs.write("/orig", &pattern(9000)).await.unwrap();

        fs.copy("/orig", "/dup", &CopyOptions::default())
            .await
            .unwrap();
        assert_eq!(fs.read("/orig").await.unwrap(), pattern(9000));
        assert_eq!(fs.read("/dup").await.unwrap(), pattern(9000));

        // Without REPLACE_EXISTING the second copy fails.
        let err = fs
            .copy("/orig", "/dup", &CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));

        let opts = CopyOptions {
            replace_existing: true,
            ..CopyOptions::default()
        };
        fs.copy("/orig", "/dup", &opts).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_attributes_propagates_mtime() {
        let fs = fs();
        fs.write("/a", b"x").await.unwrap();
        let src_mtime = fs.metadata("/a").await.unwrap().last_modified;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let opts = CopyOptions {
            copy_attributes: true,
            ..CopyOptions::default()
        };
        fs.copy("/a", "/b", &opts).await.unwrap();
        assert_eq!(fs.metadata("/b").await.unwrap().last_modified, src_mtime);
    }

    #[tokio::test]
    async fn test_execute_access_never_permitted() {
        let fs = fs();
        fs.write("/bin", b"#!").await.unwrap();
        fs.check_access("/bin", &[AccessMode::Read, AccessMode::Write])
            .await
            .unwrap();
        let err = fs
            .check_access("/bin", &[AccessMode::Execute])
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::AccessDenied { .. }));

        // A missing node reports absence before any mode is considered.
        let err = fs
            .check_access("/missing", &[AccessMode::Execute])
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::NoSuchFile { .. }));
    }

    #[tokio::test]
    async fn test_root_always_exists_and_is_protected() {
        let fs = fs();
        assert!(fs.exists("/").await.unwrap());
        assert!(fs.read_dir("/").await.unwrap().is_empty());
        assert!(matches!(
            fs.remove("/").await.unwrap_err(),
            FsError::AccessDenied { .. }
        ));
        assert!(matches!(
            fs.rename("/", "/elsewhere", &MoveOptions::default())
                .await
                .unwrap_err(),
            FsError::AccessDenied { .. }
        ));
    }

    #[tokio::test]
    async fn test_create_dir_requires_parent() {
        let fs = fs();
        let err = fs.create_dir("/missing/child").await.unwrap_err();
        assert!(matches!(err, FsError::NoSuchFile { .. }));

        fs.create_dir_all("/missing/child").await.unwrap();
        assert_eq!(
            fs.metadata("/missing/child").await.unwrap().kind,
            FileType::Folder
        );
    }

    #[tokio::test]
    async fn test_backslash_paths_accepted() {
        let fs = fs();
        fs.create_dir("\\w").await.unwrap();
        fs.write("\\w\\f", b"win").await.unwrap();
        assert_eq!(fs.read("/w/f").await.unwrap(), b"win");
        assert!(fs.same_file("\\w\\f", "/w/f").unwrap());
    }

    struct FixedOverlay;

    impl LocalOverlay for FixedOverlay {
        fn is_dir(&self, path: &str) -> bool {
            matches!(path, "/local" | "/local/sub")
        }

        fn list_children(&self, path: &str) -> Vec<String> {
            match path {
                "/local" => vec!["sub".to_string(), "readme.txt".to_string()],
                _ => Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_overlay_children_join_enumeration() {
        let fs = KvFs::with_overlay(
            Arc::new(MemoryDatastore::new()),
            FsConfig::default(),
            Arc::new(FixedOverlay),
        );

        let entries = fs.read_dir("/local").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["readme.txt", "sub"]);
        assert_eq!(entries[1].kind, FileType::Folder);
    }

    #[tokio::test]
    async fn test_shadow_folder_materialises_for_child_create() {
        let fs = KvFs::with_overlay(
            Arc::new(MemoryDatastore::new()),
            FsConfig::default(),
            Arc::new(FixedOverlay),
        );

        // /local/sub has no datastore entity, but the overlay reports a
        // local directory there, so creating a child materialises it.
        fs.write("/local/sub/new.txt", b"data").await.unwrap();
        assert_eq!(
            fs.metadata("/local/sub").await.unwrap().kind,
            FileType::Folder
        );
        assert_eq!(fs.metadata("/local").await.unwrap().kind, FileType::Folder);
    }

    #[tokio::test]
    async fn test_concurrent_create_new_single_winner() {
        let fs = fs();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let fs = fs.clone();
            tasks.push(tokio::spawn(async move {
                let mut opts = OpenOptions::new();
                opts.write(true).create_new(true);
                match fs.open("/race", &opts).await {
                    Ok(handle) => {
                        handle.close().await.unwrap();
                        true
                    }
                    Err(FsError::AlreadyExists { .. }) => false,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(fs.exists("/race").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_delete_parent_and_create_child() {
        for _ in 0..8 {
            let fs = fs();
            fs.create_dir("/p").await.unwrap();

            let fs_del = fs.clone();
            let deleter = tokio::spawn(async move { fs_del.remove("/p").await });
            let fs_crt = fs.clone();
            let creator = tokio::spawn(async move { fs_crt.write("/p/child", b"x").await });

            let _ = deleter.await.unwrap();
            let _ = creator.await.unwrap();

            // Whatever interleaving won, no orphan child may remain
            // outside its parent's child list.
            if fs.exists("/p/child").await.unwrap() {
                let names: Vec<String> = fs
                    .read_dir("/p")
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|e| e.name)
                    .collect();
                assert_eq!(names, vec!["child"]);
            } else {
                assert!(fs.read_dir("/p").await.is_err() || fs.read_dir("/p").await.unwrap().is_empty());
            }
        }
    }
}
