use std::collections::HashSet;

use crate::error::FetchError;

/// How a request trades freshness against latency and offline availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefreshPolicy {
    /// Serve cached data; refresh in the background once it is stale.
    #[default]
    CacheFirst,
    /// Serve cached data, then always refresh.
    CacheThenNetwork,
    /// Fetch first, fall back to cached data on failure.
    NetworkFirst,
    /// Fetch, never look at cached data.
    NetworkOnly,
    /// Cached data only, never touch the network.
    CacheOnly,
}

impl RefreshPolicy {
    pub fn uses_network(&self) -> bool {
        !matches!(self, RefreshPolicy::CacheOnly)
    }
}

impl std::str::FromStr for RefreshPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "cachefirst" => Ok(RefreshPolicy::CacheFirst),
            "cachethennetwork" => Ok(RefreshPolicy::CacheThenNetwork),
            "networkfirst" => Ok(RefreshPolicy::NetworkFirst),
            "networkonly" => Ok(RefreshPolicy::NetworkOnly),
            "cacheonly" => Ok(RefreshPolicy::CacheOnly),
            other => Err(anyhow::anyhow!("Unknown refresh policy: {}", other)),
        }
    }
}

/// One observation of an entity as seen through an `EntitySource`.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceState<T> {
    Loading {
        key: String,
    },
    Success {
        data: T,
        /// Ids of nested entities that are still being loaded.
        linked_entities_loading: HashSet<String>,
        /// True only while a background refresh for this key is running.
        is_refreshing: bool,
        /// Milliseconds since the epoch when `data` was fetched.
        cached_at: Option<i64>,
    },
    Error {
        key: String,
        cause: FetchError,
        stale_data: Option<T>,
    },
    NotFound {
        key: String,
    },
}

impl<T> SourceState<T> {
    pub fn loading(key: impl Into<String>) -> Self {
        SourceState::Loading { key: key.into() }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        SourceState::NotFound { key: key.into() }
    }

    /// The freshest data this state carries, stale or not.
    pub fn data(&self) -> Option<&T> {
        match self {
            SourceState::Success { data, .. } => Some(data),
            SourceState::Error { stale_data, .. } => stale_data.as_ref(),
            SourceState::Loading { .. } | SourceState::NotFound { .. } => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, SourceState::Loading { .. })
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self, SourceState::Success { is_refreshing: true, .. })
    }

    /// Whether `other` shows subscribers nothing new.
    ///
    /// Two `Success` states from the same cache entry carry the same
    /// timestamp. Errors always count as new.
    pub fn same_snapshot(&self, other: &Self) -> bool {
        match (self, other) {
            (SourceState::Loading { key: a }, SourceState::Loading { key: b })
            | (SourceState::NotFound { key: a }, SourceState::NotFound { key: b }) => a == b,
            (
                SourceState::Success {
                    linked_entities_loading: linked_a,
                    is_refreshing: refreshing_a,
                    cached_at: Some(at_a),
                    ..
                },
                SourceState::Success {
                    linked_entities_loading: linked_b,
                    is_refreshing: refreshing_b,
                    cached_at: Some(at_b),
                    ..
                },
            ) => at_a == at_b && refreshing_a == refreshing_b && linked_a == linked_b,
            _ => false,
        }
    }

    /// Nothing further will be emitted for this state without new demand.
    pub fn is_terminal(&self) -> bool {
        match self {
            SourceState::Loading { .. } => false,
            SourceState::Success { is_refreshing, .. } => !is_refreshing,
            SourceState::Error { .. } | SourceState::NotFound { .. } => true,
        }
    }
}
