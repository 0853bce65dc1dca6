pub mod discrete_files;
pub mod memory;
pub mod replacement;

use crate::entry::CacheEntry;
use crate::error::StoreError;
use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

/// Where cache entries live. The resolver never owns entry storage; it only decides when to read,
/// when to write and when to go to the source of record.
///
/// Per-key operations must be atomic. Nothing is promised about ordering across keys, and writes
/// are last-writer-wins.
#[async_trait]
pub trait CacheStoreStrategy<Key, Value>: Send + Sync
where
    Key: Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    async fn get(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>>;

    /// A platform read of a value. When replacement strategies are used (e.g. LRU) reads have side
    /// effects that update internal tracking. If hydration requires inspecting the current state,
    /// these reads will skew tracking. Peek allows you to inspect state without side effects, it
    /// signals to any layer that a platform read has occurred that should be ignored for usage
    /// tracking purposes.
    async fn peek(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>>;

    /// Inserts the entry under `entry.key`, replacing whatever was there.
    async fn put(&self, entry: CacheEntry<Key, Value>) -> StoreResult<()>;

    /// Returns whether an entry was actually removed.
    async fn delete(&self, key: &Key) -> StoreResult<bool>;

    async fn flush(&self) -> StoreResult<()>;

    async fn keys(&self) -> StoreResult<Vec<Key>>;

    async fn contains(&self, key: &Key) -> StoreResult<bool>;
}
