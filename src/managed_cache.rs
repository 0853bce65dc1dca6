use crate::error::ResolveError;
use crate::hydration::pull::PullCacheHydrator;
use crate::hydration::{CacheHydrationStrategy, CacheLookupSuccess, ResolveOptions};
use crate::source_of_record::SourceOfRecord;
use crate::store::CacheStoreStrategy;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The public face of a cache: resolves keys through a hydration strategy using a set of default
/// options that individual calls may override.
pub struct ManagedCache<Key, Value>
where
    Key: Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    hydrator: Box<dyn CacheHydrationStrategy<Key, Value>>,
    defaults: ResolveOptions,
}

impl<Key, Value> ManagedCache<Key, Value>
where
    Key: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    pub fn new(hydrator: Box<dyn CacheHydrationStrategy<Key, Value>>) -> Self {
        Self::with_defaults(hydrator, ResolveOptions::default())
    }

    pub fn with_defaults(
        hydrator: Box<dyn CacheHydrationStrategy<Key, Value>>,
        defaults: ResolveOptions,
    ) -> Self {
        Self { hydrator, defaults }
    }

    /// Pull hydration over the given store and source of record.
    pub fn pull(
        store: Arc<dyn CacheStoreStrategy<Key, Value>>,
        data_source: Arc<dyn SourceOfRecord<Key, Value>>,
        defaults: ResolveOptions,
    ) -> Self {
        Self::with_defaults(
            Box::new(PullCacheHydrator::new(store, data_source)),
            defaults,
        )
    }

    pub fn defaults(&self) -> &ResolveOptions {
        &self.defaults
    }

    /// Resolve `key` to its value, from the cache where allowed and the source of record
    /// otherwise.
    pub async fn resolve(&self, key: &Key, options: &ResolveOptions) -> Result<Value, ResolveError> {
        self.lookup(key, options)
            .await
            .map(CacheLookupSuccess::into_value)
    }

    /// Like [`resolve`](Self::resolve), reporting how the value was obtained.
    #[instrument(level = "debug", skip(self, options), fields(force_fresh = options.force_fresh))]
    pub async fn lookup(
        &self,
        key: &Key,
        options: &ResolveOptions,
    ) -> Result<CacheLookupSuccess<Value>, ResolveError> {
        let outcome = self.hydrator.get(key, options).await?;
        debug!(outcome = outcome.kind(), "Resolved");
        Ok(outcome)
    }

    /// [`lookup`](Self::lookup) with the cache's default options.
    pub async fn get(&self, key: &Key) -> Result<CacheLookupSuccess<Value>, ResolveError> {
        let defaults = self.defaults;
        self.lookup(key, &defaults).await
    }

    /// Drop the cached entry for `key`. Store failures surface as `CacheUnavailable`.
    pub async fn invalidate(&self, key: &Key) -> Result<bool, ResolveError> {
        self.hydrator.stop_tracking(key).await
    }

    pub async fn flush(&self) -> Result<(), ResolveError> {
        self.hydrator.flush().await
    }

    /// Waits for background refreshes started by earlier lookups to finish.
    pub async fn settle(&self) {
        let settled = self.hydrator.settle().await;
        if settled > 0 {
            debug!(settled, "Background refreshes settled");
        }
    }
}
