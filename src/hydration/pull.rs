use crate::clock::{Clock, SystemClock};
use crate::entry::{CacheEntry, Freshness};
use crate::error::ResolveError;
use crate::hydration::single_flight::SingleFlight;
use crate::hydration::{CacheHydrationStrategy, CacheLookupSuccess, ResolveOptions};
use crate::source_of_record::SourceOfRecord;
use crate::store::CacheStoreStrategy;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hydrates on read: the store is consulted first and the source of record only when the stored
/// value cannot be served, with stale values served immediately while a detached task refreshes
/// them.
///
/// At most one fetch per key is in flight at any time, whether it was started by a foreground
/// miss or by a background revalidation. Must be used from within a Tokio runtime.
pub struct PullCacheHydrator<Key, Value>
where
    Key: Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    store: Arc<dyn CacheStoreStrategy<Key, Value>>,
    data_source: Arc<dyn SourceOfRecord<Key, Value>>,
    clock: Arc<dyn Clock>,
    in_flight: SingleFlight<Key, Value>,
}

impl<Key, Value> PullCacheHydrator<Key, Value>
where
    Key: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn CacheStoreStrategy<Key, Value>>,
        data_source: Arc<dyn SourceOfRecord<Key, Value>>,
    ) -> Self {
        Self::with_clock(store, data_source, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CacheStoreStrategy<Key, Value>>,
        data_source: Arc<dyn SourceOfRecord<Key, Value>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        PullCacheHydrator {
            store,
            data_source,
            clock,
            in_flight: SingleFlight::new(),
        }
    }

    /// Whether a fetch for `key` is currently outstanding.
    pub fn is_refreshing(&self, key: &Key) -> bool {
        self.in_flight.is_in_flight(key)
    }

    /// Reads the stored entry if it can be served: present, readable, valid and not past hard
    /// expiry.
    async fn servable_entry(
        &self,
        key: &Key,
    ) -> Option<(CacheEntry<Key, Value>, Freshness)> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(?key, "Cache miss");
                return None;
            }
            Err(err) => {
                warn!(?key, error = %err, "Cache store unavailable, treating as miss");
                return None;
            }
        };

        if !self.data_source.is_valid(key, &entry.value) {
            debug!(?key, "Cached value failed validation, treating as miss");
            return None;
        }

        match entry.freshness(self.clock.now()) {
            Freshness::Expired => {
                debug!(?key, stored_at = %entry.stored_at, "Cached value past hard expiry");
                None
            }
            freshness => Some((entry, freshness)),
        }
    }

    async fn try_hydrate(&self, key: &Key, options: &ResolveOptions) -> Result<Value, ResolveError> {
        self.in_flight
            .run(key, || self.fetch_and_store(key.clone(), None, *options))
            .await
    }

    /// Fire-and-forget. A trigger while a fetch for the key is outstanding is a no-op.
    fn revalidate_in_background(&self, key: &Key, current_value: Value, options: &ResolveOptions) {
        let started = self.in_flight.trigger(key, || {
            let logged_key = key.clone();
            let refresh = self.fetch_and_store(key.clone(), Some(current_value), *options);
            async move {
                let result = refresh.await;
                if let Err(err) = &result {
                    warn!(
                        key = ?logged_key,
                        error = %err,
                        "Background revalidation failed, keeping stale entry"
                    );
                }
                result
            }
        });

        if started {
            debug!(?key, "Scheduled background revalidation");
        } else {
            debug!(?key, "Revalidation already in flight");
        }
    }

    /// The owned unit of work a single-flight slot runs: fetch, validate, store.
    fn fetch_and_store(
        &self,
        key: Key,
        current_value: Option<Value>,
        options: ResolveOptions,
    ) -> impl Future<Output = Result<Value, ResolveError>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let data_source = Arc::clone(&self.data_source);
        let clock = Arc::clone(&self.clock);

        async move {
            let value = match &current_value {
                Some(current) => data_source.retrieve_with_hint(&key, current).await?,
                None => data_source.retrieve(&key).await?,
            };

            if !data_source.is_valid(&key, &value) {
                return Err(ResolveError::invalid_response(format!(
                    "source of record returned a value for {key:?} that failed validation"
                )));
            }

            let entry = CacheEntry::new(
                key,
                value.clone(),
                clock.now(),
                options.ttl,
                options.stale_while_revalidate,
            );
            if let Err(err) = store.put(entry).await {
                warn!(error = %err, "Failed to store fetched value, serving it uncached");
            }

            Ok(value)
        }
    }
}

#[async_trait]
impl<Key, Value> CacheHydrationStrategy<Key, Value> for PullCacheHydrator<Key, Value>
where
    Key: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    async fn get(
        &self,
        key: &Key,
        options: &ResolveOptions,
    ) -> Result<CacheLookupSuccess<Value>, ResolveError> {
        if options.force_fresh {
            debug!(?key, "Forced refresh, skipping cache read");
            return self
                .try_hydrate(key, options)
                .await
                .map(CacheLookupSuccess::Refresh);
        }

        match self.servable_entry(key).await {
            Some((entry, Freshness::Fresh)) => {
                debug!(?key, "Cache hit");
                Ok(CacheLookupSuccess::Hit(entry.value))
            }
            Some((entry, _)) => {
                self.revalidate_in_background(key, entry.value.clone(), options);
                Ok(CacheLookupSuccess::Stale(entry.value))
            }
            None => self
                .try_hydrate(key, options)
                .await
                .map(CacheLookupSuccess::Miss),
        }
    }

    async fn flush(&self) -> Result<(), ResolveError> {
        self.store.flush().await.map_err(ResolveError::from)
    }

    async fn stop_tracking(&self, key: &Key) -> Result<bool, ResolveError> {
        self.store.delete(key).await.map_err(ResolveError::from)
    }

    async fn settle(&self) -> usize {
        self.in_flight.settle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreResult;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);
    const SWR: Duration = Duration::from_secs(60);

    /// Hands out scripted answers in order and counts calls.
    struct ScriptedSource {
        answers: Mutex<Vec<Result<u32, ResolveError>>>,
        calls: AtomicUsize,
        hinted_calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(mut answers: Vec<Result<u32, ResolveError>>) -> Arc<Self> {
            answers.reverse();
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: AtomicUsize::new(0),
                hinted_calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceOfRecord<&'static str, u32> for ScriptedSource {
        async fn retrieve(&self, _key: &&'static str) -> Result<u32, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ResolveError::remote_unavailable("script exhausted")))
        }

        async fn retrieve_with_hint(
            &self,
            key: &&'static str,
            _current_value: &u32,
        ) -> Result<u32, ResolveError> {
            self.hinted_calls.fetch_add(1, Ordering::SeqCst);
            self.retrieve(key).await
        }

        fn is_valid(&self, _key: &&'static str, value: &u32) -> bool {
            *value < 1000
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStoreStrategy<&'static str, u32> for BrokenStore {
        async fn get(&self, _key: &&'static str) -> StoreResult<Option<CacheEntry<&'static str, u32>>> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn peek(&self, key: &&'static str) -> StoreResult<Option<CacheEntry<&'static str, u32>>> {
            self.get(key).await
        }

        async fn put(&self, _entry: CacheEntry<&'static str, u32>) -> StoreResult<()> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn delete(&self, _key: &&'static str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn flush(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("disk gone".into()))
        }

        async fn keys(&self) -> StoreResult<Vec<&'static str>> {
            Ok(Vec::new())
        }

        async fn contains(&self, _key: &&'static str) -> StoreResult<bool> {
            Ok(false)
        }
    }

    struct Fixture {
        store: Arc<MemoryStore<&'static str, u32>>,
        source: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
        hydrator: PullCacheHydrator<&'static str, u32>,
    }

    fn fixture(answers: Vec<Result<u32, ResolveError>>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let source = ScriptedSource::new(answers);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hydrator = PullCacheHydrator::with_clock(store.clone(), source.clone(), clock.clone());
        Fixture {
            store,
            source,
            clock,
            hydrator,
        }
    }

    fn options() -> ResolveOptions {
        ResolveOptions::new(TTL, SWR)
    }

    #[tokio::test]
    async fn miss_fetches_and_stores() {
        let f = fixture(vec![Ok(7)]);

        let result = f.hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Miss(7));

        let stored = f.store.get(&"k").await.unwrap().unwrap();
        assert_eq!(stored.value, 7);
        assert_eq!(stored.stored_at, f.clock.now());
        assert_eq!(stored.ttl, TTL);
        assert_eq!(stored.stale_while_revalidate, SWR);
    }

    #[tokio::test]
    async fn fresh_entry_is_a_hit_without_fetching() {
        let f = fixture(vec![Ok(7)]);
        f.hydrator.get(&"k", &options()).await.unwrap();

        f.clock.advance(TTL);
        let result = f.hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Hit(7));
        assert_eq!(f.source.calls(), 1);
    }

    #[tokio::test]
    async fn stale_entry_is_served_then_refreshed_in_background() {
        let f = fixture(vec![Ok(7), Ok(8)]);
        f.hydrator.get(&"k", &options()).await.unwrap();

        f.clock.advance(TTL + Duration::from_secs(1));
        let result = f.hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Stale(7));

        f.hydrator.settle().await;
        assert_eq!(f.source.calls(), 2);
        assert_eq!(f.source.hinted_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.get(&"k").await.unwrap().unwrap().value, 8);

        let result = f.hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Hit(8));
    }

    #[tokio::test]
    async fn failed_background_refresh_keeps_stale_entry() {
        let f = fixture(vec![Ok(7), Err(ResolveError::remote_unavailable("down"))]);
        f.hydrator.get(&"k", &options()).await.unwrap();
        let original = f.store.get(&"k").await.unwrap().unwrap();

        f.clock.advance(TTL + Duration::from_secs(1));
        assert_eq!(
            f.hydrator.get(&"k", &options()).await.unwrap(),
            CacheLookupSuccess::Stale(7)
        );
        f.hydrator.settle().await;

        assert_eq!(f.store.get(&"k").await.unwrap(), Some(original));
        assert_eq!(
            f.hydrator.get(&"k", &options()).await.unwrap(),
            CacheLookupSuccess::Stale(7)
        );
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let f = fixture(vec![Ok(7), Ok(9)]);
        f.hydrator.get(&"k", &options()).await.unwrap();

        f.clock.advance(TTL + SWR + Duration::from_secs(1));
        let result = f.hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Miss(9));
        assert_eq!(f.source.hinted_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_fresh_bypasses_a_fresh_entry() {
        let f = fixture(vec![Ok(7), Ok(8)]);
        f.hydrator.get(&"k", &options()).await.unwrap();

        let result = f
            .hydrator
            .get(&"k", &options().with_force_fresh(true))
            .await
            .unwrap();
        assert_eq!(result, CacheLookupSuccess::Refresh(8));
        assert_eq!(f.store.get(&"k").await.unwrap().unwrap().value, 8);
    }

    #[tokio::test]
    async fn foreground_failure_surfaces_and_leaves_cache_unset() {
        let f = fixture(vec![Err(ResolveError::remote_unavailable("down"))]);

        let err = f.hydrator.get(&"k", &options()).await.unwrap_err();
        assert_eq!(err, ResolveError::remote_unavailable("down"));
        assert!(!f.store.contains(&"k").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_remote_value_is_rejected_and_not_stored() {
        let f = fixture(vec![Ok(5000)]);

        let err = f.hydrator.get(&"k", &options()).await.unwrap_err();
        assert!(err.is_invalid_response());
        assert!(!f.store.contains(&"k").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_cached_value_is_treated_as_miss() {
        let f = fixture(vec![Ok(3)]);
        f.store
            .put(CacheEntry::new("k", 5000, f.clock.now(), TTL, SWR))
            .await
            .unwrap();

        let result = f.hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Miss(3));
    }

    #[tokio::test]
    async fn unavailable_store_falls_through_to_remote() {
        let source = ScriptedSource::new(vec![Ok(4)]);
        let hydrator = PullCacheHydrator::new(Arc::new(BrokenStore), source.clone());

        let result = hydrator.get(&"k", &options()).await.unwrap();
        assert_eq!(result, CacheLookupSuccess::Miss(4));
        assert!(hydrator.stop_tracking(&"k").await.is_err());
    }

    #[tokio::test]
    async fn stop_tracking_and_flush_reach_the_store() {
        let f = fixture(vec![Ok(1), Ok(2)]);
        f.hydrator.get(&"a", &options()).await.unwrap();
        f.hydrator.get(&"b", &options()).await.unwrap();

        assert!(f.hydrator.stop_tracking(&"a").await.unwrap());
        assert!(!f.store.contains(&"a").await.unwrap());

        f.hydrator.flush().await.unwrap();
        assert!(f.store.keys().await.unwrap().is_empty());
    }
}
