use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::store::{CacheStoreStrategy, StoreResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const PARTIAL_WRITE_EXTENSION: &str = "partial";

/// Stores each entry in its own file under `cache_directory`, named by a random UUID. The whole
/// [`CacheEntry`] is written, key included, so the index can be rebuilt from disk.
///
/// Before using the non-volatile flavour, strongly consider the volatile one. Do you really need
/// this cache to rehydrate without hitting the source of record? You are sacrificing reboot to
/// clear corruption and now must consider N vs N+1 schema issues when downgrading or upgrading
/// your application. Entries that no longer decode are skipped on open.
pub struct DiscreteFileStore<Key, Value, Serde> {
    cache_directory: PathBuf,
    index: Mutex<HashMap<Key, PathBuf>>,
    phantom_serde: PhantomData<fn() -> Serde>,
    phantom_value: PhantomData<fn() -> Value>,
}

impl<Key, Value, Serde> DiscreteFileStore<Key, Value, Serde>
where
    Key: Clone + Eq + Hash + Serialize + DeserializeOwned,
    Value: Serialize + DeserializeOwned,
    Serde: DiscreteFileSerializerDeserializer,
{
    /// Opens the store with an empty directory, discarding anything a previous process left.
    pub async fn volatile(cache_directory: PathBuf) -> StoreResult<Self> {
        remove_dir_if_present(&cache_directory).await?;
        fs::create_dir_all(&cache_directory).await?;

        Ok(Self::empty(cache_directory))
    }

    /// Opens the store and rebuilds the index from whatever entries are already on disk.
    pub async fn non_volatile(cache_directory: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&cache_directory).await?;
        let store = Self::empty(cache_directory);
        store.rehydrate_index().await?;

        Ok(store)
    }

    pub fn cache_directory(&self) -> &Path {
        &self.cache_directory
    }

    fn empty(cache_directory: PathBuf) -> Self {
        Self {
            cache_directory,
            index: Mutex::new(HashMap::new()),
            phantom_serde: PhantomData,
            phantom_value: PhantomData,
        }
    }

    async fn rehydrate_index(&self) -> StoreResult<()> {
        let mut files = fs::read_dir(&self.cache_directory).await?;
        let mut recovered = HashMap::new();

        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().is_some_and(|ext| ext == PARTIAL_WRITE_EXTENSION) {
                let _ = fs::remove_file(&path).await;
                continue;
            }

            match read_entry::<Serde, Key, Value>(&path).await {
                Ok(Some(entry)) => {
                    recovered.insert(entry.key, path);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable cache file");
                }
            }
        }

        debug!(
            directory = %self.cache_directory.display(),
            entries = recovered.len(),
            "Rehydrated discrete file index"
        );
        *self.lock_index("rehydrate")? = recovered;
        Ok(())
    }

    fn lock_index(
        &self,
        op: &'static str,
    ) -> StoreResult<std::sync::MutexGuard<'_, HashMap<Key, PathBuf>>> {
        self.index.lock().map_err(|_| StoreError::poisoned(op))
    }

    fn indexed_path(&self, key: &Key, op: &'static str) -> StoreResult<Option<PathBuf>> {
        Ok(self.lock_index(op)?.get(key).cloned())
    }

    /// The file an entry for `key` is written to. New keys get a fresh name that is only indexed
    /// once the file is in place.
    fn path_for(&self, key: &Key) -> StoreResult<PathBuf> {
        let indexed = self.indexed_path(key, "put")?;
        Ok(indexed.unwrap_or_else(|| {
            self.cache_directory
                .join(Uuid::new_v4().hyphenated().to_string())
        }))
    }
}

#[async_trait]
impl<Key, Value, Serde> CacheStoreStrategy<Key, Value> for DiscreteFileStore<Key, Value, Serde>
where
    Key: Clone + Eq + Hash + Serialize + DeserializeOwned + Send + Sync + 'static,
    Value: Serialize + DeserializeOwned + Send + Sync + 'static,
    Serde: DiscreteFileSerializerDeserializer,
{
    async fn get(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>> {
        match self.indexed_path(key, "get")? {
            Some(path) => read_entry::<Serde, Key, Value>(&path).await,
            None => Ok(None),
        }
    }

    async fn peek(&self, key: &Key) -> StoreResult<Option<CacheEntry<Key, Value>>> {
        self.get(key).await
    }

    async fn put(&self, entry: CacheEntry<Key, Value>) -> StoreResult<()> {
        let path = self.path_for(&entry.key)?;
        let bytes = Serde::serialize(&entry)?;

        // Write beside the target and rename over it so readers never see a torn file.
        let partial = path.with_extension(format!(
            "{}.{PARTIAL_WRITE_EXTENSION}",
            Uuid::new_v4().simple()
        ));
        if let Err(err) = write_then_rename(&partial, &path, bytes).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err.into());
        }

        let replaced = self.lock_index("put")?.insert(entry.key, path.clone());
        if let Some(previous) = replaced.filter(|previous| *previous != path) {
            // A concurrent first write of the same key lost the race for the index.
            let _ = fs::remove_file(previous).await;
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> StoreResult<bool> {
        let removed = self.lock_index("delete")?.remove(key);
        match removed {
            Some(path) => match fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
                Err(err) => Err(err.into()),
            },
            None => Ok(false),
        }
    }

    async fn flush(&self) -> StoreResult<()> {
        self.lock_index("flush")?.clear();
        remove_dir_if_present(&self.cache_directory).await?;
        fs::create_dir_all(&self.cache_directory).await?;
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<Key>> {
        Ok(self.lock_index("keys")?.keys().cloned().collect())
    }

    async fn contains(&self, key: &Key) -> StoreResult<bool> {
        Ok(self.lock_index("contains")?.contains_key(key))
    }
}

async fn read_entry<Serde, Key, Value>(path: &Path) -> StoreResult<Option<CacheEntry<Key, Value>>>
where
    Serde: DiscreteFileSerializerDeserializer,
    Key: DeserializeOwned,
    Value: DeserializeOwned,
{
    match fs::read(path).await {
        Ok(bytes) => Serde::deserialize(&bytes).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_then_rename(partial: &Path, path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    fs::write(partial, bytes).await?;
    fs::rename(partial, path).await
}

async fn remove_dir_if_present(directory: &Path) -> StoreResult<()> {
    match fs::remove_dir_all(directory).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Abstracts away the selection of the on-disk format.
pub trait DiscreteFileSerializerDeserializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(value: &T) -> StoreResult<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T>;
}

pub struct JsonDiscreteFileSerializerDeserializer;

impl DiscreteFileSerializerDeserializer for JsonDiscreteFileSerializerDeserializer {
    fn serialize<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|err| StoreError::Serialization(err.to_string()))
    }
}

pub struct BincodeDiscreteFileSerializerDeserializer;

impl DiscreteFileSerializerDeserializer for BincodeDiscreteFileSerializerDeserializer {
    fn serialize<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        bincode::serialize(value).map_err(|err| StoreError::Serialization(err.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        bincode::deserialize(bytes).map_err(|err| StoreError::Serialization(err.to_string()))
    }
}

pub type DiscreteFileStoreJson<Key, Value> =
    DiscreteFileStore<Key, Value, JsonDiscreteFileSerializerDeserializer>;
pub type DiscreteFileStoreBincode<Key, Value> =
    DiscreteFileStore<Key, Value, BincodeDiscreteFileSerializerDeserializer>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn entry(key: &str, value: &str) -> CacheEntry<String, String> {
        CacheEntry::new(
            key.to_string(),
            value.to_string(),
            Utc::now(),
            Duration::from_secs(60),
            Duration::from_secs(120),
        )
    }

    #[tokio::test]
    async fn non_volatile_store_rehydrates_its_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");

        let first = DiscreteFileStoreJson::<String, String>::non_volatile(path.clone())
            .await
            .unwrap();
        first.put(entry("a", "subscribed")).await.unwrap();
        first.put(entry("b", "pending")).await.unwrap();
        drop(first);

        let second = DiscreteFileStoreJson::<String, String>::non_volatile(path)
            .await
            .unwrap();
        let mut keys = second.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        let found = second.get(&"b".to_string()).await.unwrap().unwrap();
        assert_eq!(found.value, "pending");
    }

    #[tokio::test]
    async fn volatile_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");

        let first = DiscreteFileStoreBincode::<String, String>::volatile(path.clone())
            .await
            .unwrap();
        first.put(entry("a", "subscribed")).await.unwrap();
        drop(first);

        let second = DiscreteFileStoreBincode::<String, String>::volatile(path)
            .await
            .unwrap();
        assert!(second.keys().await.unwrap().is_empty());
        assert_eq!(second.get(&"a".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bincode_entries_round_trip_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiscreteFileStoreBincode::<String, String>::non_volatile(dir.path().into())
            .await
            .unwrap();
        let written = entry("a", "subscribed");
        store.put(written.clone()).await.unwrap();

        assert_eq!(store.get(&"a".to_string()).await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn undecodable_files_are_skipped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garbage"), b"not json").unwrap();

        let store = DiscreteFileStoreJson::<String, String>::non_volatile(dir.path().into())
            .await
            .unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replacing_an_entry_reuses_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiscreteFileStoreJson::<String, String>::non_volatile(dir.path().into())
            .await
            .unwrap();
        store.put(entry("a", "pending")).await.unwrap();
        store.put(entry("a", "subscribed")).await.unwrap();

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
        let found = store.get(&"a".to_string()).await.unwrap().unwrap();
        assert_eq!(found.value, "subscribed");
    }

    #[tokio::test]
    async fn delete_and_flush_remove_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let store = DiscreteFileStoreJson::<String, String>::non_volatile(path.clone())
            .await
            .unwrap();
        store.put(entry("a", "pending")).await.unwrap();
        store.put(entry("b", "pending")).await.unwrap();

        assert!(store.delete(&"a".to_string()).await.unwrap());
        assert!(!store.delete(&"a".to_string()).await.unwrap());
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 1);

        store.flush().await.unwrap();
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);
        assert!(!store.contains(&"b".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn failed_write_is_not_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let store = DiscreteFileStoreJson::<String, String>::non_volatile(path.clone())
            .await
            .unwrap();
        std::fs::remove_dir_all(&path).unwrap();

        assert!(store.put(entry("a", "pending")).await.is_err());
        assert!(!store.contains(&"a".to_string()).await.unwrap());
        assert!(store.keys().await.unwrap().is_empty());

        std::fs::create_dir_all(&path).unwrap();
        store.put(entry("a", "subscribed")).await.unwrap();
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 1);
        assert!(store.contains(&"a".to_string()).await.unwrap());
    }
}
