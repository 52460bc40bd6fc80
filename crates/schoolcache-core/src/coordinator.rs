//! Deduplication of concurrent remote fetches.
//!
//! At most one fetch runs per key. Callers that arrive while a fetch is in
//! flight attach to it and receive the very same outcome, success or error.
//! The fetch itself runs on its own task, so it always completes and applies
//! its writes even if every caller stops waiting.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error};

use crate::error::FetchError;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Per-key record of a running fetch. Removed as soon as the fetch finishes.
struct InFlightFetch<T> {
    result: SharedFetch<T>,
    started_at: Instant,
}

type InFlightTable<K, T> = Arc<Mutex<HashMap<K, InFlightFetch<T>>>>;

pub struct FetchCoordinator<K, T> {
    in_flight: InFlightTable<K, T>,
}

impl<K, T> Default for FetchCoordinator<K, T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Deregisters the in-flight record when the fetch task ends, including
/// when it panics or is aborted at runtime shutdown.
struct Deregister<K: Eq + Hash, T> {
    table: InFlightTable<K, T>,
    key: Option<K>,
}

impl<K: Eq + Hash, T> Drop for Deregister<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.remove(&key);
        }
    }
}

impl<K, T> FetchCoordinator<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `key` unless a fetch for `key` is already running,
    /// in which case wait for that one instead.
    ///
    /// Errors are handed to every waiting caller unchanged and never retried
    /// here; retry policy belongs to the caller.
    pub async fn coordinate_refresh<F, Fut>(&self, key: K, operation: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let shared = {
            let mut table = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match table.get(&key) {
                Some(existing) => {
                    debug!(
                        key = ?key,
                        in_flight_ms = existing.started_at.elapsed().as_millis() as u64,
                        "Joining in-flight fetch"
                    );
                    existing.result.clone()
                }
                None => {
                    debug!(key = ?key, "Starting coordinated fetch");
                    let fetch = operation();
                    let deregister = Deregister {
                        table: Arc::clone(&self.in_flight),
                        key: Some(key.clone()),
                    };
                    // The record is inserted below while the lock is still held,
                    // so `deregister` can never run before it exists.
                    let task = tokio::spawn(async move {
                        let _deregister = deregister;
                        fetch.await
                    });
                    let task_key = key.clone();
                    let result = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                error!(key = ?task_key, error = %e, "Coordinated fetch task failed");
                                Err(FetchError::Defect(format!("fetch task failed: {}", e)))
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    table.insert(
                        key,
                        InFlightFetch {
                            result: result.clone(),
                            started_at: Instant::now(),
                        },
                    );
                    result
                }
            }
        };

        shared.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait for every running fetch, including ones started while waiting.
    ///
    /// Fetch tasks are cancelled when the runtime shuts down, so callers
    /// drain before exiting to let started fetches persist.
    pub async fn drain(&self) {
        loop {
            let pending: Vec<SharedFetch<T>> = self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(|fetch| fetch.result.clone())
                .collect();
            if pending.is_empty() {
                return;
            }
            debug!(count = pending.len(), "Draining in-flight fetches");
            futures::future::join_all(pending).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::sync::Notify;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_fetch() {
        let coordinator: FetchCoordinator<String, u64> = FetchCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let callers = (0..8).map(|_| {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            coordinator.coordinate_refresh("group-9c".to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(42)
            })
        });

        // join! polls the callers first, so all of them register before release
        let (results, _) = tokio::join!(join_all(callers), async {
            tokio::task::yield_now().await;
            gate.notify_one();
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(42)));
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_reaches_every_caller() {
        let coordinator: FetchCoordinator<String, u64> = FetchCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let callers = (0..4).map(|_| {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            coordinator.coordinate_refresh("school".to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Err::<u64, _>(FetchError::Server("503".to_string()))
            })
        });

        let (results, _) = tokio::join!(join_all(callers), async {
            tokio::task::yield_now().await;
            gate.notify_one();
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Err(FetchError::Server("503".to_string())));
        }
        assert!(!coordinator.is_in_flight(&"school".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_calls_fetch_again() {
        let coordinator: FetchCoordinator<&'static str, usize> = FetchCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let calls = Arc::clone(&calls);
            let result = coordinator
                .coordinate_refresh("key", move || async move {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await;
            assert_eq!(result, Ok(expected));
        }
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_run_in_parallel() {
        let coordinator: FetchCoordinator<&'static str, &'static str> = FetchCoordinator::new();
        let gate = Arc::new(Notify::new());

        let blocked_gate = Arc::clone(&gate);
        let blocked = coordinator.coordinate_refresh("a", move || async move {
            blocked_gate.notified().await;
            Ok("a")
        });
        let free = coordinator.coordinate_refresh("b", || async { Ok("b") });

        let (a, b) = tokio::join!(blocked, async {
            let b = free.await;
            gate.notify_one();
            b
        });
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Ok("b"));
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_completes() {
        let coordinator: FetchCoordinator<&'static str, u32> = FetchCoordinator::new();
        let applied = Arc::new(AtomicUsize::new(0));

        let side_effect = Arc::clone(&applied);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.coordinate_refresh("slow", move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                side_effect.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_abandoned_fetches() {
        let coordinator: FetchCoordinator<&'static str, u32> = FetchCoordinator::new();
        let applied = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b"] {
            let side_effect = Arc::clone(&applied);
            let abandoned = tokio::time::timeout(
                Duration::from_millis(5),
                coordinator.coordinate_refresh(key, move || async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    side_effect.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }),
            )
            .await;
            assert!(abandoned.is_err());
        }
        assert_eq!(coordinator.in_flight_count(), 2);

        coordinator.drain().await;
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.in_flight_count(), 0);

        // Nothing in flight: returns immediately
        coordinator.drain().await;
    }
}
