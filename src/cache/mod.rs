//! Read-side caching.
//!
//! - `ResponseCache`: memory-only, TTL-stamped responses keyed by endpoint
//!   and sorted params, with de-duplication of concurrent identical requests
//! - `EntityCache`: durable entity replica that lives until invalidated

mod entities;
mod entity;
mod key;
mod response;

pub use entities::EntityCache;
pub use entity::CachedEntity;
pub use key::cache_key;
pub use response::{CacheConfig, CacheEntry, FetchResult, ResponseCache, SharedFetch};
