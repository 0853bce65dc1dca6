use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::store::{CacheStoreStrategy, StoreResult};
use ::lru::LruCache;
use async_trait::async_trait;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Implements the Least Recently Used replacement strategy on top of an arbitrary data store.
///
/// While it supports non-volatile data, the usage order metadata is held in memory volatile.
/// For example, if you restart the process the same data will load, but the order depends on
/// the order the underlying store iterates keys over. This tradeoff was chosen because committing
/// usage tracking in a non-volatile store means that all read operations are now writes in
/// potentially expensive calls. Given that the point of a cache is to optimize reads + storing
/// the order perfectly over long periods of time isn't a real use case, this is the better default
/// implementation.
pub struct LruReplacementStrategy<Key, Value>
where
    Key: Eq + Hash + Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    store: Box<dyn CacheStoreStrategy<Key, Value>>,
    usage_order: Mutex<LruCache<Key, ()>>,
}

impl<Key, Value> LruReplacementStrategy<Key, Value>
where
    Key: Eq + Hash + Clone + Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    /// If the data store is non-volatile, there might already be data present. Its keys seed an
    /// arbitrary usage order, and anything past `max_capacity` is evicted straight away.
    pub async fn new(
        max_capacity: NonZeroUsize,
        store: Box<dyn CacheStoreStrategy<Key, Value>>,
    ) -> StoreResult<Self> {
        let lru = Self {
            store,
            usage_order: Mutex::new(LruCache::new(max_capacity)),
        };

        for key in lru.store.keys().await? {
            if let Some(evicted) = lru.add_to_usage_order(key)? {
                lru.store.delete(&evicted).await?;
            }
        }

        Ok(lru)
    }

    pub fn max_capacity(&self) -> usize {
        self.usage_order
            .lock()
            .map(|order| order.cap().get())
            .unwrap_or_default()
    }

    fn order(&self, op: &'static str) -> StoreResult<MutexGuard<'_, LruCache<Key, ()>>> {
        self.usage_order.lock().map_err(|_| StoreError::poisoned(op))
    }

    /// A stored key missing from the usage order is tracked again, which can push another key out.
    fn mark_as_most_recent(&self, key: &Key) -> StoreResult<Option<Key>> {
        let mut order = self.order("get")?;
        if order.get(key).is_some() {
            return Ok(None);
        }
        Ok(push_tracked(&mut order, key.clone()))
    }

    /// Returns the key pushed out to make room, if any.
    fn add_to_usage_order(&self, key: Key) -> StoreResult<Option<Key>> {
        let mut order = self.order("put")?;
        Ok(push_tracked(&mut order, key))
    }

    async fn evict(&self, evicted: Option<Key>) -> StoreResult<()>
    where
        Key: std::fmt::Debug,
    {
        if let Some(evicted) = evicted {
            debug!(key = ?evicted, "Evicting least recently used entry");
            self.store.delete(&evicted).await?;
        }
        Ok(())
    }

    fn remove_from_usage_order(&self, key: &Key) -> StoreResult<()> {
        self.order("delete")?.pop(key);
        Ok(())
    }
}

fn push_tracked<Key: Eq + Hash + Clone>(order: &mut LruCache<Key, ()>, key: Key) -> Option<Key> {
    match order.push(key.clone(), ()) {
        Some((evicted, _)) if evicted != key => Some(evicted),
        _ => None,
    }
}

#[async_trait]
impl<Key, Value> CacheStoreStrategy<Key, Value> for LruReplacementStrategy<Key, Value>
where
    Key: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    Value: Send + Sync + 'static,
{
    async fn get(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>> {
        let found = self.store.get(key).await?;
        match found {
            Some(_) => {
                let evicted = self.mark_as_most_recent(key)?;
                self.evict(evicted).await?;
            }
            None => self.remove_from_usage_order(key)?,
        }
        Ok(found)
    }

    async fn peek(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>> {
        self.store.peek(key).await
    }

    async fn put(&self, entry: CacheEntry<Key, Value>) -> StoreResult<()> {
        let key = entry.key.clone();
        self.store.put(entry).await?;

        let evicted = self.add_to_usage_order(key)?;
        self.evict(evicted).await
    }

    async fn delete(&self, key: &Key) -> StoreResult<bool> {
        self.remove_from_usage_order(key)?;
        self.store.delete(key).await
    }

    async fn flush(&self) -> StoreResult<()> {
        self.order("flush")?.clear();
        self.store.flush().await
    }

    async fn keys(&self) -> StoreResult<Vec<Key>> {
        // We can optimize by guaranteeing a memory lookup checking the metadata instead of the
        // underlying store, which may or may not be in memory
        Ok(self.order("keys")?.iter().map(|(key, _)| key.clone()).collect())
    }

    async fn contains(&self, key: &Key) -> StoreResult<bool> {
        Ok(self.order("contains")?.contains(key))
    }
}
