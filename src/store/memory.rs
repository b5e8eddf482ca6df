//! In-memory datastore for local development and tests. Enforces the
//! platform bulk ceilings so engine batching bugs surface early.

use super::{Datastore, DatastoreTx, Entity, Key, MAX_BULK_BYTES, MAX_BULK_GET_KEYS, MAX_BULK_PUT_ENTITIES};
use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryDatastore {
    map: Arc<RwLock<HashMap<Key, Bytes>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities, for test assertions.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    /// Keys currently stored under the given prefix, for test assertions.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<Key> {
        let guard = self.map.read().await;
        let mut keys: Vec<Key> = guard
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

fn check_put_limits(entities: &[Entity]) -> Result<()> {
    if entities.len() > MAX_BULK_PUT_ENTITIES {
        bail!(
            "bulk put of {} entities exceeds the {MAX_BULK_PUT_ENTITIES}-entity limit",
            entities.len()
        );
    }
    let cost: usize = entities.iter().map(Entity::cost).sum();
    if entities.len() > 1 && cost > MAX_BULK_BYTES {
        bail!("bulk put of {cost} bytes exceeds the {MAX_BULK_BYTES}-byte limit");
    }
    Ok(())
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &Key) -> Result<Option<Entity>> {
        let guard = self.map.read().await;
        Ok(guard
            .get(key)
            .map(|data| Entity::new(key.clone(), data.clone())))
    }

    async fn get_many(&self, keys: &[Key]) -> Result<HashMap<Key, Entity>> {
        if keys.len() > MAX_BULK_GET_KEYS {
            bail!(
                "bulk get of {} keys exceeds the {MAX_BULK_GET_KEYS}-key limit",
                keys.len()
            );
        }
        let guard = self.map.read().await;
        let mut found = HashMap::new();
        for key in keys {
            if let Some(data) = guard.get(key) {
                found.insert(key.clone(), Entity::new(key.clone(), data.clone()));
            }
        }
        Ok(found)
    }

    async fn put(&self, entity: Entity) -> Result<()> {
        let mut guard = self.map.write().await;
        guard.insert(entity.key, entity.data);
        Ok(())
    }

    async fn put_many(&self, entities: Vec<Entity>) -> Result<()> {
        check_put_limits(&entities)?;
        let mut guard = self.map.write().await;
        for entity in entities {
            guard.insert(entity.key, entity.data);
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let mut guard = self.map.write().await;
        guard.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[Key]) -> Result<()> {
        let mut guard = self.map.write().await;
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }

    async fn begin_tx(&self) -> Result<Box<dyn DatastoreTx>> {
        Ok(Box::new(MemoryTx {
            map: Arc::clone(&self.map),
            buffered: Vec::new(),
        }))
    }
}

/// Buffered transaction: puts accumulate in memory and apply atomically
/// under the write lock on commit.
struct MemoryTx {
    map: Arc<RwLock<HashMap<Key, Bytes>>>,
    buffered: Vec<Entity>,
}

#[async_trait]
impl DatastoreTx for MemoryTx {
    async fn put_many(&mut self, entities: Vec<Entity>) -> Result<()> {
        check_put_limits(&entities)?;
        self.buffered.extend(entities);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut guard = self.map.write().await;
        for entity in self.buffered {
            guard.insert(entity.key, entity.data);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
