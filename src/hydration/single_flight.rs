//! Per-key coalescing of remote fetches.
//!
//! Every fetch runs as its own spawned task and is published as a shared future, so any number of
//! callers can await one underlying operation. The map entry is removed by the task itself once
//! the fetch settles, even if nobody is awaiting it any more.

use crate::error::ResolveError;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

type SharedFetch<Value> = Shared<BoxFuture<'static, Result<Value, ResolveError>>>;
type InFlightMap<Key, Value> = Arc<Mutex<HashMap<Key, SharedFetch<Value>>>>;

pub struct SingleFlight<Key, Value> {
    in_flight: InFlightMap<Key, Value>,
}

impl<Key, Value> Default for SingleFlight<Key, Value> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<Key, Value> SingleFlight<Key, Value>
where
    Key: Clone + Eq + Hash + Send + Sync + 'static,
    Value: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Awaits the fetch already in flight for `key`, or starts one with `start` and awaits that.
    pub async fn run<F, Fut>(&self, key: &Key, start: F) -> Result<Value, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        let (fetch, _) = self.join_or_start(key, start);
        fetch.await
    }

    /// Starts a fetch with `start` unless one is already in flight for `key`. Does not wait.
    ///
    /// Returns whether a new fetch was started.
    pub fn trigger<F, Fut>(&self, key: &Key, start: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        let (_, started) = self.join_or_start(key, start);
        started
    }

    pub fn is_in_flight(&self, key: &Key) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Waits for every fetch outstanding at the time of the call to finish, whatever its outcome.
    ///
    /// Detached fetches die with the runtime, so a short-lived process calls this before exiting.
    pub async fn settle(&self) -> usize {
        let outstanding: Vec<_> = lock(&self.in_flight).values().cloned().collect();
        let settled = outstanding.len();
        join_all(outstanding).await;
        settled
    }

    fn join_or_start<F, Fut>(&self, key: &Key, start: F) -> (SharedFetch<Value>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        let mut in_flight = lock(&self.in_flight);
        if let Some(existing) = in_flight.get(key) {
            return (existing.clone(), false);
        }

        // The map lock is held until the entry is inserted, so the task cannot clear it early.
        let work = start();
        let guard = InFlightGuard {
            registry: Arc::clone(&self.in_flight),
            key: key.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });

        let fetch = async move {
            handle.await.unwrap_or_else(|err| {
                Err(ResolveError::remote_unavailable(format!(
                    "fetch task did not complete: {err}"
                )))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(key.clone(), fetch.clone());
        (fetch, true)
    }
}

/// Clears the map entry when the fetch task finishes, including by panic.
struct InFlightGuard<Key, Value>
where
    Key: Eq + Hash,
{
    registry: InFlightMap<Key, Value>,
    key: Key,
}

impl<Key, Value> Drop for InFlightGuard<Key, Value>
where
    Key: Eq + Hash,
{
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.key);
    }
}

fn lock<Key, Value>(
    map: &Mutex<HashMap<Key, SharedFetch<Value>>>,
) -> MutexGuard<'_, HashMap<Key, SharedFetch<Value>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned in-flight fetch map"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn concurrent_runs_share_one_fetch() {
        let flights = Arc::new(SingleFlight::<String, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            waiters.push(tokio::spawn(async move {
                flights
                    .run(&"k".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok::<_, ResolveError>(42)
                    })
                    .await
            }));
        }

        while !flights.is_in_flight(&"k".to_string()) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_is_a_no_op_while_a_fetch_is_outstanding() {
        let flights = SingleFlight::<&'static str, u32>::new();
        let release = Arc::new(Notify::new());

        let gate = Arc::clone(&release);
        assert!(flights.trigger(&"k", move || async move {
            gate.notified().await;
            Ok::<_, ResolveError>(1)
        }));
        assert!(!flights.trigger(&"k", || async { Ok::<_, ResolveError>(2) }));

        release.notify_one();
        while flights.is_in_flight(&"k") {
            tokio::task::yield_now().await;
        }
        assert_eq!(flights.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn entry_is_cleared_after_failure_so_the_next_call_retries() {
        let flights = SingleFlight::<&'static str, u32>::new();

        let first = flights
            .run(&"k", || async { Err::<u32, _>(ResolveError::remote_unavailable("down")) })
            .await;
        assert_eq!(first, Err(ResolveError::remote_unavailable("down")));

        while flights.is_in_flight(&"k") {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            flights.run(&"k", || async { Ok::<_, ResolveError>(5) }).await,
            Ok(5)
        );
    }

    async fn explode() -> Result<u32, ResolveError> {
        panic!("fetcher blew up")
    }

    #[tokio::test]
    async fn panicking_fetch_surfaces_as_remote_unavailable() {
        let flights = SingleFlight::<&'static str, u32>::new();

        let result = flights.run(&"k", explode).await;
        assert!(matches!(result, Err(ResolveError::RemoteUnavailable(_))));
        assert!(!flights.is_in_flight(&"k"));
    }

    #[tokio::test]
    async fn settle_waits_for_triggered_fetches() {
        let flights = SingleFlight::<&'static str, u32>::new();
        let done = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b"] {
            let done = Arc::clone(&done);
            flights.trigger(&key, move || async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResolveError>(1)
            });
        }

        assert_eq!(flights.settle().await, 2);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(flights.settle().await, 0);
    }
}
