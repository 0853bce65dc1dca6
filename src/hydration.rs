pub mod pull;
pub mod single_flight;

use crate::error::ResolveError;
use async_trait::async_trait;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * DAY.as_secs());
pub const DEFAULT_STALE_WHILE_REVALIDATE: Duration = Duration::from_secs(30 * DAY.as_secs());

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CacheLookupSuccess<Value> {
    /// Value was not servable from the underlying store (absent, invalid, expired or unreadable)
    /// and had to be fetched from source of record.
    Miss(Value),

    /// The cache read was skipped on request and the value was fetched from source of record.
    Refresh(Value),

    /// Stale value was found in underlying store and returned as is. A background refresh from
    /// source of record has been scheduled, or was already in flight.
    Stale(Value),

    /// Fresh value found in underlying store.
    Hit(Value),
}

impl<Value> CacheLookupSuccess<Value> {
    pub fn value(&self) -> &Value {
        match self {
            Self::Miss(value) | Self::Refresh(value) | Self::Stale(value) | Self::Hit(value) => {
                value
            }
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Miss(value) | Self::Refresh(value) | Self::Stale(value) | Self::Hit(value) => {
                value
            }
        }
    }

    /// True when the value came from the store without a foreground remote fetch.
    pub fn was_served_from_cache(&self) -> bool {
        matches!(self, Self::Stale(_) | Self::Hit(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Miss(_) => "miss",
            Self::Refresh(_) => "refresh",
            Self::Stale(_) => "stale",
            Self::Hit(_) => "hit",
        }
    }
}

/// Per-call knobs for a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Skip the cache read and go straight to the source of record.
    pub force_fresh: bool,
    /// How long after storing a value it is served without revalidation.
    pub ttl: Duration,
    /// How long after the fresh window a stale value may still be served while it is refreshed.
    pub stale_while_revalidate: Duration,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            force_fresh: false,
            ttl: DEFAULT_TTL,
            stale_while_revalidate: DEFAULT_STALE_WHILE_REVALIDATE,
        }
    }
}

impl ResolveOptions {
    pub fn new(ttl: Duration, stale_while_revalidate: Duration) -> Self {
        Self {
            force_fresh: false,
            ttl,
            stale_while_revalidate,
        }
    }

    pub fn with_force_fresh(mut self, force_fresh: bool) -> Self {
        self.force_fresh = force_fresh;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = window;
        self
    }
}

#[async_trait]
pub trait CacheHydrationStrategy<Key, Value>: Send + Sync
where
    Key: Send + Sync + 'static,
    Value: Send + Sync + 'static,
{
    async fn get(
        &self,
        key: &Key,
        options: &ResolveOptions,
    ) -> Result<CacheLookupSuccess<Value>, ResolveError>;

    async fn flush(&self) -> Result<(), ResolveError>;

    /// Drops the cached entry for `key`, returning whether one existed.
    async fn stop_tracking(&self, key: &Key) -> Result<bool, ResolveError>;

    /// Waits for background work started by earlier lookups. Returns how many tasks it waited on.
    async fn settle(&self) -> usize {
        0
    }
}
