//! Capacity-based eviction layered over any [`CacheStoreStrategy`](crate::store::CacheStoreStrategy).

pub mod lru;

pub use self::lru::LruReplacementStrategy;
