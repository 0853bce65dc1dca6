//! A cache-backed resolver for remotely sourced status values.
//!
//! Lookups go through a [`ManagedCache`], which consults a [`CacheStoreStrategy`] first, serves
//! stale values while revalidating them in the background, and coalesces concurrent fetches from
//! the [`SourceOfRecord`] so that at most one is in flight per key.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod hydration;
pub mod managed_cache;
pub mod newsletter;
pub mod source_of_record;
pub mod store;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, Freshness};
pub use error::{ResolveError, StoreError};
pub use hydration::pull::PullCacheHydrator;
pub use hydration::{CacheHydrationStrategy, CacheLookupSuccess, ResolveOptions};
pub use managed_cache::ManagedCache;
pub use source_of_record::SourceOfRecord;
pub use store::CacheStoreStrategy;
