use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::store::{CacheStoreStrategy, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// Volatile in-process store. Construct once at startup and share it behind an `Arc`.
pub struct MemoryStore<Key, Value> {
    data: RwLock<HashMap<Key, CacheEntry<Key, Value>>>,
}

impl<Key, Value> Default for MemoryStore<Key, Value> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Key, Value> MemoryStore<Key, Value> {
    pub fn new() -> Self {
        MemoryStore {
            data: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<Key, Value> CacheStoreStrategy<Key, Value> for MemoryStore<Key, Value>
where
    Key: Eq + Hash + Clone + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>> {
        let data = self.data.read().map_err(|_| StoreError::poisoned("get"))?;
        Ok(data.get(key).cloned())
    }

    async fn peek(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>> {
        self.get(key).await
    }

    async fn put(&self, entry: CacheEntry<Key, Value>) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::poisoned("put"))?;
        data.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> StoreResult<bool> {
        let mut data = self.data.write().map_err(|_| StoreError::poisoned("delete"))?;
        Ok(data.remove(key).is_some())
    }

    async fn flush(&self) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::poisoned("flush"))?;
        data.clear();
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<Key>> {
        let data = self.data.read().map_err(|_| StoreError::poisoned("keys"))?;
        Ok(data.keys().cloned().collect())
    }

    async fn contains(&self, key: &Key) -> StoreResult<bool> {
        let data = self.data.read().map_err(|_| StoreError::poisoned("contains"))?;
        Ok(data.contains_key(key))
    }
}
