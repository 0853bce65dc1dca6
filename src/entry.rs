use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value plus the metadata that decides whether it may be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<Key, Value> {
    pub key: Key,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
}

/// Where `now` falls relative to an entry's fresh and hard-expiry boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now <= stored_at + ttl`
    Fresh,
    /// Past the fresh boundary, but `now <= stored_at + ttl + stale_while_revalidate`.
    Stale,
    /// Past the hard-expiry boundary; must not be served.
    Expired,
}

impl<Key, Value> CacheEntry<Key, Value> {
    pub fn new(
        key: Key,
        value: Value,
        stored_at: DateTime<Utc>,
        ttl: Duration,
        stale_while_revalidate: Duration,
    ) -> Self {
        Self {
            key,
            value,
            stored_at,
            ttl,
            stale_while_revalidate,
        }
    }

    /// `None` means the boundary is beyond what a timestamp can represent, i.e. never reached.
    pub fn fresh_until(&self) -> Option<DateTime<Utc>> {
        offset(self.stored_at, self.ttl)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl
            .checked_add(self.stale_while_revalidate)
            .and_then(|window| offset(self.stored_at, window))
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if self.fresh_until().map_or(true, |boundary| now <= boundary) {
            Freshness::Fresh
        } else if self.expires_at().map_or(true, |boundary| now <= boundary) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

fn offset(from: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    let by = chrono::Duration::from_std(by).ok()?;
    from.checked_add_signed(by)
}
