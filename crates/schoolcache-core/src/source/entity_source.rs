use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EntityAdapter, EntityKey, EntityValue, RefreshPolicy, SourceState, SourceStream};
use crate::cache::{CacheConfig, CacheEntry, EntityCache};
use crate::coordinator::FetchCoordinator;
use crate::error::FetchError;

/// How long a stream outlives its last subscriber.
/// Long enough to absorb a UI tearing down and re-creating its observers.
const DEFAULT_GRACE_PERIOD_MS: u64 = 5000;

#[derive(Debug, Clone, Copy)]
pub struct SourceConfig {
    pub cache: CacheConfig,
    pub grace_period: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

/// Live, shared execution for one key.
struct LiveStream<T> {
    generation: u64,
    sender: watch::Sender<SourceState<T>>,
    linked_loaded: Arc<Mutex<HashSet<String>>>,
    subscribers: usize,
    driver: JoinHandle<()>,
}

struct SourceInner<ID: EntityKey, T: EntityValue> {
    adapter: Arc<dyn EntityAdapter<ID, T>>,
    cache: Arc<EntityCache<ID, T>>,
    coordinator: Arc<FetchCoordinator<ID, CacheEntry<T>>>,
    streams: Mutex<HashMap<ID, LiveStream<T>>>,
    grace_period: Duration,
    next_generation: AtomicU64,
}

/// Generic cache/local/remote orchestrator for one entity type.
///
/// Cloning is cheap and every clone shares the same cache, coordinator and
/// live streams.
pub struct EntitySource<ID: EntityKey, T: EntityValue> {
    inner: Arc<SourceInner<ID, T>>,
}

impl<ID: EntityKey, T: EntityValue> Clone for EntitySource<ID, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<ID: EntityKey, T: EntityValue> EntitySource<ID, T> {
    pub fn new(adapter: Arc<dyn EntityAdapter<ID, T>>, config: SourceConfig) -> Self {
        Self::with_shared(
            adapter,
            Arc::new(EntityCache::new(config.cache)),
            Arc::new(FetchCoordinator::new()),
            config.grace_period,
        )
    }

    /// Build a source around a cache and coordinator owned elsewhere.
    pub fn with_shared(
        adapter: Arc<dyn EntityAdapter<ID, T>>,
        cache: Arc<EntityCache<ID, T>>,
        coordinator: Arc<FetchCoordinator<ID, CacheEntry<T>>>,
        grace_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                adapter,
                cache,
                coordinator,
                streams: Mutex::new(HashMap::new()),
                grace_period,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &EntityCache<ID, T> {
        &self.inner.cache
    }

    /// Subscribe to the states of `id`.
    ///
    /// Subscribers of a key that already has a live stream join it, whatever
    /// policy they ask for. `force_refresh` restarts the execution of a live
    /// stream under `policy`; existing subscribers observe the restart.
    pub fn get(&self, id: ID, policy: RefreshPolicy, force_refresh: bool) -> SourceStream<T> {
        let mut streams = self.inner.lock_streams();

        if let Some(live) = streams.get_mut(&id) {
            if force_refresh {
                debug!(key = %id, ?policy, "Restarting live stream");
                live.driver.abort();
                live.sender.send_replace(self.inner.initial_state(
                    &id,
                    policy,
                    true,
                    &live.linked_loaded,
                ));
                live.driver = self.inner.spawn_driver(
                    id.clone(),
                    policy,
                    true,
                    live.sender.clone(),
                    Arc::clone(&live.linked_loaded),
                );
            } else {
                debug!(key = %id, subscribers = live.subscribers + 1, "Joining live stream");
            }
            live.subscribers += 1;
            let subscription = self.subscription(id, live.generation);
            return SourceStream::new(live.sender.subscribe(), subscription);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let linked_loaded = Arc::new(Mutex::new(HashSet::new()));
        let initial = self
            .inner
            .initial_state(&id, policy, force_refresh, &linked_loaded);
        let (sender, receiver) = watch::channel(initial);
        let driver = self.inner.spawn_driver(
            id.clone(),
            policy,
            force_refresh,
            sender.clone(),
            Arc::clone(&linked_loaded),
        );
        debug!(key = %id, ?policy, force_refresh, "Starting live stream");

        streams.insert(
            id.clone(),
            LiveStream {
                generation,
                sender,
                linked_loaded,
                subscribers: 1,
                driver,
            },
        );
        SourceStream::new(receiver, self.subscription(id, generation))
    }

    /// `get` with the default policy and no forced refresh.
    pub fn observe(&self, id: ID) -> SourceStream<T> {
        self.get(id, RefreshPolicy::default(), false)
    }

    /// One coordinated remote fetch for `id`, persisted and cached on success.
    pub async fn refresh(&self, id: &ID) -> std::result::Result<T, FetchError> {
        self.inner.refresh(id).await.map(|entry| entry.value)
    }

    /// Drop the cached value and the live stream of `id`.
    pub fn invalidate(&self, id: &ID) {
        self.inner.cache.invalidate(id);
        if let Some(live) = self.inner.lock_streams().remove(id) {
            live.driver.abort();
        }
        debug!(key = %id, "Invalidated");
    }

    /// Drop every cached value and every live stream.
    pub fn invalidate_all(&self) {
        self.inner.cache.clear();
        self.close();
    }

    /// Stop every live stream without touching cached values.
    ///
    /// Coordinated fetches already running still complete and persist.
    pub fn close(&self) {
        let drained: Vec<_> = self.inner.lock_streams().drain().collect();
        for (_, live) in &drained {
            live.driver.abort();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closed live streams");
        }
    }

    /// Seed cache and local storage with a value obtained elsewhere.
    pub async fn prewarm(&self, id: ID, value: T) -> Result<()> {
        self.inner.adapter.save_to_local(&id, &value).await?;
        let entry = self.inner.cache.put(id.clone(), value);
        self.inner.show_live(&id, &entry);
        debug!(key = %id, "Prewarmed");
        Ok(())
    }

    /// Re-read `id` from local storage after it was written behind the
    /// source's back, updating the cache and any live stream.
    ///
    /// Returns false, with the cached value dropped, if storage holds nothing.
    pub async fn reload(&self, id: &ID) -> Result<bool> {
        match self.inner.adapter.fetch_from_local(id).await? {
            Some(value) => {
                let entry = self.inner.cache.put(id.clone(), value);
                self.inner.show_live(id, &entry);
                debug!(key = %id, "Reloaded from local storage");
                Ok(true)
            }
            None => {
                self.inner.cache.invalidate(id);
                Ok(false)
            }
        }
    }

    /// Wait for every coordinated fetch that is still running.
    pub async fn drain(&self) {
        self.inner.coordinator.drain().await;
    }

    /// Record that a linked entity of `id` finished loading.
    pub fn mark_linked_loaded(&self, id: &ID, linked_id: &str) {
        let streams = self.inner.lock_streams();
        let Some(live) = streams.get(id) else {
            return;
        };
        live.linked_loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(linked_id.to_string());
        live.sender.send_if_modified(|state| match state {
            SourceState::Success {
                linked_entities_loading,
                ..
            } => linked_entities_loading.remove(linked_id),
            _ => false,
        });
    }

    /// Number of keys with a live stream.
    pub fn live_streams(&self) -> usize {
        self.inner.lock_streams().len()
    }

    fn subscription(&self, id: ID, generation: u64) -> Box<dyn FnOnce() + Send + Sync> {
        let source = Arc::downgrade(&self.inner);
        Box::new(move || SourceInner::release(source, id, generation))
    }
}

/// Send `state` unless subscribers already see the same snapshot, e.g. the
/// one `get` seeded the channel with.
fn publish<T: EntityValue>(sender: &watch::Sender<SourceState<T>>, state: SourceState<T>) {
    sender.send_if_modified(|current| {
        if current.same_snapshot(&state) {
            false
        } else {
            *current = state;
            true
        }
    });
}

impl<ID: EntityKey, T: EntityValue> SourceInner<ID, T> {
    fn lock_streams(&self) -> std::sync::MutexGuard<'_, HashMap<ID, LiveStream<T>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `entry` on the live stream of `id`, if there is one.
    fn show_live(&self, id: &ID, entry: &CacheEntry<T>) {
        if let Some(live) = self.lock_streams().get(id) {
            let is_refreshing = live.sender.borrow().is_refreshing();
            live.sender
                .send_replace(self.success(entry, is_refreshing, &live.linked_loaded));
        }
    }

    /// What a new subscriber sees before the driver has run at all.
    fn initial_state(
        &self,
        id: &ID,
        policy: RefreshPolicy,
        force_refresh: bool,
        linked_loaded: &Mutex<HashSet<String>>,
    ) -> SourceState<T> {
        let cached = match policy {
            RefreshPolicy::NetworkFirst | RefreshPolicy::NetworkOnly => None,
            _ => self.cache.peek(id),
        };
        match (policy, cached) {
            (RefreshPolicy::CacheFirst, Some(entry)) => {
                let refreshing = force_refresh || self.cache.is_stale(&entry);
                self.success(&entry, refreshing, linked_loaded)
            }
            (RefreshPolicy::CacheThenNetwork, Some(entry)) => {
                self.success(&entry, true, linked_loaded)
            }
            (RefreshPolicy::CacheOnly, Some(entry)) => self.success(&entry, false, linked_loaded),
            _ => SourceState::loading(id.to_string()),
        }
    }

    fn spawn_driver(
        self: &Arc<Self>,
        id: ID,
        policy: RefreshPolicy,
        force_refresh: bool,
        sender: watch::Sender<SourceState<T>>,
        linked_loaded: Arc<Mutex<HashSet<String>>>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner
                .drive(id, policy, force_refresh, sender, linked_loaded)
                .await;
        })
    }

    async fn drive(
        &self,
        id: ID,
        policy: RefreshPolicy,
        force_refresh: bool,
        sender: watch::Sender<SourceState<T>>,
        linked_loaded: Arc<Mutex<HashSet<String>>>,
    ) {
        match policy {
            RefreshPolicy::CacheFirst => match self.cached(&id).await {
                Some(entry) if !force_refresh && !self.cache.is_stale(&entry) => {
                    debug!(key = %id, "Serving fresh cached value");
                    publish(&sender, self.success(&entry, false, &linked_loaded));
                }
                Some(entry) => {
                    publish(&sender, self.success(&entry, true, &linked_loaded));
                    self.background_refresh(&id, entry, &sender, &linked_loaded)
                        .await;
                }
                None => {
                    publish(&sender, SourceState::loading(id.to_string()));
                    let outcome = self.refresh(&id).await;
                    publish(&sender, self.outcome(&id, outcome, &linked_loaded));
                }
            },
            RefreshPolicy::CacheThenNetwork => match self.cached(&id).await {
                Some(entry) => {
                    publish(&sender, self.success(&entry, true, &linked_loaded));
                    self.background_refresh(&id, entry, &sender, &linked_loaded)
                        .await;
                }
                None => {
                    publish(&sender, SourceState::loading(id.to_string()));
                    let outcome = self.refresh(&id).await;
                    publish(&sender, self.outcome(&id, outcome, &linked_loaded));
                }
            },
            RefreshPolicy::NetworkFirst => {
                publish(&sender, SourceState::loading(id.to_string()));
                match self.refresh(&id).await {
                    Ok(entry) => {
                        publish(&sender, self.success(&entry, false, &linked_loaded));
                    }
                    Err(e) => match self.cached(&id).await {
                        Some(entry) => {
                            warn!(key = %id, error = %e, "Fetch failed, falling back to cached value");
                            publish(&sender, self.success(&entry, false, &linked_loaded));
                        }
                        None => {
                            publish(&sender, self.outcome(&id, Err(e), &linked_loaded));
                        }
                    },
                }
            }
            RefreshPolicy::NetworkOnly => {
                publish(&sender, SourceState::loading(id.to_string()));
                let outcome = self.refresh(&id).await;
                publish(&sender, self.outcome(&id, outcome, &linked_loaded));
            }
            RefreshPolicy::CacheOnly => {
                let state = match self.cached(&id).await {
                    Some(entry) => self.success(&entry, false, &linked_loaded),
                    None => SourceState::not_found(id.to_string()),
                };
                publish(&sender, state);
            }
        }
    }

    /// Refresh behind data that subscribers already have. A failure keeps
    /// the cached data on screen and only clears the refreshing flag.
    async fn background_refresh(
        &self,
        id: &ID,
        cached: CacheEntry<T>,
        sender: &watch::Sender<SourceState<T>>,
        linked_loaded: &Mutex<HashSet<String>>,
    ) {
        match self.refresh(id).await {
            Ok(entry) => {
                publish(sender, self.success(&entry, false, linked_loaded));
            }
            Err(e) => {
                warn!(key = %id, error = %e, "Background refresh failed, keeping cached value");
                publish(sender, self.success(&cached, false, linked_loaded));
            }
        }
    }

    async fn refresh(&self, id: &ID) -> std::result::Result<CacheEntry<T>, FetchError> {
        let adapter = Arc::clone(&self.adapter);
        let cache = Arc::clone(&self.cache);
        let key = id.clone();
        self.coordinator
            .coordinate_refresh(id.clone(), move || async move {
                let value = adapter.fetch_from_remote(&key).await?;
                adapter
                    .save_to_local(&key, &value)
                    .await
                    .map_err(|e| FetchError::Storage(format!("{:#}", e)))?;
                info!(key = %key, "Fetched and persisted");
                Ok(cache.put(key, value))
            })
            .await
    }

    /// Cached entry for `id`, loading it from local storage on a memory miss.
    async fn cached(&self, id: &ID) -> Option<CacheEntry<T>> {
        if let Some(entry) = self.cache.peek(id) {
            debug!(key = %id, "Memory cache hit");
            return Some(entry);
        }
        match self.adapter.fetch_from_local(id).await {
            Ok(Some(value)) => {
                debug!(key = %id, "Local storage hit");
                // A refresh that finished meanwhile holds newer data
                Some(self.cache.put_if_absent(id.clone(), value))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %id, error = %e, "Failed to read local storage, treating as miss");
                None
            }
        }
    }

    fn success(
        &self,
        entry: &CacheEntry<T>,
        is_refreshing: bool,
        linked_loaded: &Mutex<HashSet<String>>,
    ) -> SourceState<T> {
        let loaded = linked_loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let linked_entities_loading = self
            .adapter
            .linked_entity_ids(&entry.value)
            .into_iter()
            .filter(|linked| !loaded.contains(linked))
            .collect();
        SourceState::Success {
            data: entry.value.clone(),
            linked_entities_loading,
            is_refreshing,
            cached_at: Some(entry.cached_at_millis()),
        }
    }

    fn outcome(
        &self,
        id: &ID,
        outcome: std::result::Result<CacheEntry<T>, FetchError>,
        linked_loaded: &Mutex<HashSet<String>>,
    ) -> SourceState<T> {
        match outcome {
            Ok(entry) => self.success(&entry, false, linked_loaded),
            Err(FetchError::NotFound(_)) => SourceState::not_found(id.to_string()),
            Err(cause) => SourceState::Error {
                key: id.to_string(),
                cause,
                stale_data: None,
            },
        }
    }

    /// Called when a subscriber drops its stream.
    fn release(source: Weak<Self>, id: ID, generation: u64) {
        let Some(inner) = source.upgrade() else {
            return;
        };
        let idle = {
            let mut streams = inner.lock_streams();
            match streams.get_mut(&id) {
                Some(live) if live.generation == generation => {
                    live.subscribers = live.subscribers.saturating_sub(1);
                    live.subscribers == 0
                }
                _ => false,
            }
        };
        if !idle {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let grace_period = inner.grace_period;
                let source = Arc::downgrade(&inner);
                handle.spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    if let Some(inner) = source.upgrade() {
                        inner.teardown_if_idle(&id, generation);
                    }
                });
            }
            Err(_) => inner.teardown_if_idle(&id, generation),
        }
    }

    fn teardown_if_idle(&self, id: &ID, generation: u64) {
        let mut streams = self.lock_streams();
        let idle = matches!(
            streams.get(id),
            Some(live) if live.generation == generation && live.subscribers == 0
        );
        if idle {
            if let Some(live) = streams.remove(id) {
                live.driver.abort();
                debug!(key = %id, "Tore down idle stream");
            }
        }
    }
}
