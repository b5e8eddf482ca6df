//! Datastore façade: entity keys, the backend trait, and the client that
//! layers a read-through memcache and bulk-operation batching on top.
//!
//! The backing platform offers typed entities under string keys with
//! per-entity atomic put/get/delete, bounded bulk operations, and optional
//! transactions. Everything richer (random access, directories) is built
//! above this module.

mod memory;

pub use memory::MemoryDatastore;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::MemcacheConfig;

/// Bulk put/delete ceiling in entities per call.
pub const MAX_BULK_PUT_ENTITIES: usize = 500;
/// Bulk get ceiling in keys per call.
pub const MAX_BULK_GET_KEYS: usize = 1000;
/// Payload ceiling per bulk call (1 MiB).
pub const MAX_BULK_BYTES: usize = 1 << 20;
/// Per-entity overhead observed against the bulk limits (key, property
/// framing) that payload accounting must include.
pub const ENTITY_OVERHEAD_BYTES: usize = 2048;
/// Conservative payload figure the batch-sizing formula divides against;
/// deliberately under [`MAX_BULK_BYTES`] so a computed batch always clears
/// the real ceiling.
const BULK_SIZE_BUDGET: usize = 1_024_000;

/// Safe entity count per bulk put for payloads of `entity_size_hint` bytes,
/// floor-clamped to 1 and capped at the entity-count ceiling.
pub fn max_entities_per_bulk(entity_size_hint: usize) -> usize {
    (BULK_SIZE_BUDGET / (entity_size_hint + ENTITY_OVERHEAD_BYTES))
        .max(1)
        .min(MAX_BULK_PUT_ENTITIES)
}

/// Canonical string key of a datastore entity.
///
/// Node entities are keyed `n:{path}`; block entities are keyed by the
/// owning file's path plus the synthetic name `block.N` where N is the
/// zero-based block index.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn node(path: &str) -> Self {
        Key(format!("n:{path}"))
    }

    pub fn block(path: &str, index: u64) -> Self {
        Key(format!("b:{path}:block.{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Approximate serialized footprint for payload accounting.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.0)
    }
}

/// A datastore entity: an opaque payload under a key. Node metadata is
/// JSON-encoded; block payloads are raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub key: Key,
    pub data: Bytes,
}

impl Entity {
    pub fn new(key: Key, data: impl Into<Bytes>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }

    /// Footprint counted against [`MAX_BULK_BYTES`].
    pub fn cost(&self) -> usize {
        self.key.len() + self.data.len() + ENTITY_OVERHEAD_BYTES
    }
}

/// Abstract backing datastore. Implementations provide per-entity atomic
/// operations; callers must respect the bulk ceilings (the client below
/// slices for them).
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Option<Entity>>;

    /// Fetch many keys; missing keys are simply absent from the result.
    async fn get_many(&self, keys: &[Key]) -> Result<HashMap<Key, Entity>>;

    /// Idempotent overwrite.
    async fn put(&self, entity: Entity) -> Result<()>;

    async fn put_many(&self, entities: Vec<Entity>) -> Result<()>;

    async fn delete(&self, key: &Key) -> Result<()>;

    async fn delete_many(&self, keys: &[Key]) -> Result<()>;

    /// Begin a transaction. Used only by the write-through flush path.
    async fn begin_tx(&self) -> Result<Box<dyn DatastoreTx>>;
}

/// An open datastore transaction. Writes are buffered until commit.
#[async_trait]
pub trait DatastoreTx: Send {
    async fn put_many(&mut self, entities: Vec<Entity>) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Thin client over a [`Datastore`] adding a transparent read-through
/// memcache and bulk slicing.
///
/// Cache discipline: a `get` consults the memcache first and populates it on
/// a datastore hit; `put` overwrites the cache entry before the datastore
/// write; `delete` invalidates before the datastore delete, so a deleted key
/// is never served from a stale cache entry.
#[derive(Clone)]
pub struct DatastoreClient {
    inner: Arc<dyn Datastore>,
    memcache: Cache<Key, Entity>,
}

impl DatastoreClient {
    pub fn new(inner: Arc<dyn Datastore>, config: &MemcacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.capacity);
        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            inner,
            memcache: builder.build(),
        }
    }

    pub async fn get(&self, key: &Key) -> Result<Option<Entity>> {
        if let Some(hit) = self.memcache.get(key).await {
            return Ok(Some(hit));
        }
        match self.inner.get(key).await? {
            Some(entity) => {
                self.memcache.insert(key.clone(), entity.clone()).await;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    pub async fn get_many(&self, keys: &[Key]) -> Result<HashMap<Key, Entity>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut misses: Vec<Key> = Vec::new();
        for key in keys {
            match self.memcache.get(key).await {
                Some(hit) => {
                    found.insert(key.clone(), hit);
                }
                None => misses.push(key.clone()),
            }
        }

        for chunk in misses.chunks(MAX_BULK_GET_KEYS) {
            let fetched = self.inner.get_many(chunk).await?;
            for (key, entity) in fetched {
                self.memcache.insert(key.clone(), entity.clone()).await;
                found.insert(key, entity);
            }
        }
        Ok(found)
    }

    pub async fn put(&self, entity: Entity) -> Result<()> {
        self.memcache
            .insert(entity.key.clone(), entity.clone())
            .await;
        self.inner.put(entity).await
    }

    /// Bulk put, sliced to respect both the entity-count and payload
    /// ceilings. Slices are written in order; an error leaves later slices
    /// unwritten.
    pub async fn put_many(&self, entities: Vec<Entity>) -> Result<()> {
        for batch in split_batches(entities) {
            for entity in &batch {
                self.memcache
                    .insert(entity.key.clone(), entity.clone())
                    .await;
            }
            debug!(entities = batch.len(), "bulk put");
            self.inner.put_many(batch).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &Key) -> Result<()> {
        self.memcache.invalidate(key).await;
        self.inner.delete(key).await
    }

    pub async fn delete_many(&self, keys: &[Key]) -> Result<()> {
        for chunk in keys.chunks(MAX_BULK_PUT_ENTITIES) {
            for key in chunk {
                self.memcache.invalidate(key).await;
            }
            self.inner.delete_many(chunk).await?;
        }
        Ok(())
    }

    /// Begin a write-through transaction. Memcache entries for entities put
    /// through the transaction are overwritten only once the commit lands.
    pub async fn begin_tx(&self) -> Result<ClientTx> {
        let tx = self.inner.begin_tx().await?;
        Ok(ClientTx {
            tx,
            memcache: self.memcache.clone(),
            staged: Vec::new(),
        })
    }
}

/// Transaction handle returned by [`DatastoreClient::begin_tx`].
pub struct ClientTx {
    tx: Box<dyn DatastoreTx>,
    memcache: Cache<Key, Entity>,
    staged: Vec<Entity>,
}

impl ClientTx {
    pub async fn put_many(&mut self, entities: Vec<Entity>) -> Result<()> {
        self.staged.extend(entities.iter().cloned());
        for batch in split_batches(entities) {
            self.tx.put_many(batch).await?;
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        for entity in self.staged {
            self.memcache.insert(entity.key.clone(), entity).await;
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await
    }
}

/// Slice a bulk put into platform-sized batches: at most
/// [`MAX_BULK_PUT_ENTITIES`] entities and [`MAX_BULK_BYTES`] of accounted
/// payload each. An oversized single entity still ships alone; the
/// per-entity put limit is the backend's to enforce.
pub fn split_batches(entities: Vec<Entity>) -> Vec<Vec<Entity>> {
    let mut batches = Vec::new();
    let mut current: Vec<Entity> = Vec::new();
    let mut current_cost = 0usize;

    for entity in entities {
        let cost = entity.cost();
        let over_bytes = !current.is_empty() && current_cost + cost > MAX_BULK_BYTES;
        if over_bytes || current.len() >= MAX_BULK_PUT_ENTITIES {
            batches.push(std::mem::take(&mut current));
            current_cost = 0;
        }
        current_cost += cost;
        current.push(entity);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
