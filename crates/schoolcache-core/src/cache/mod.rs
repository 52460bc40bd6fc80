//! In-memory caching of resolved entities.
//!
//! This module provides the `EntityCache`, a TTL-aware map from entity key
//! to the last known value and the moment it was fetched. Entries are
//! considered stale after 60 minutes unless configured otherwise.
//!
//! Expiry is lazy: nothing is evicted on read. `get` hides stale entries,
//! `peek` returns them so callers can serve stale data while refreshing.

pub mod entity_cache;

pub use entity_cache::{CacheConfig, CacheEntry, EntityCache};
