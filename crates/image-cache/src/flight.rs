//! Per-key coordination of concurrent cache operations

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Deduplicates concurrent operations on the same key
///
/// The first caller for a key starts the operation; callers arriving while it
/// is in flight await the same future and receive a clone of its output.
pub(crate) struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, Flight<T>>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) async fn run<M, F>(&self, key: &str, make: M) -> T
    where
        M: FnOnce() -> F,
        F: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.to_string();
                    let op = make();
                    // The flight unregisters itself when it completes, whichever
                    // waiter happens to drive it.
                    let flight = async move {
                        let output = op.await;
                        lock(&registry).remove(&owned_key);
                        output
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }
}

/// Per-key async locks serializing different operations on one key
pub(crate) struct KeyLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Held while an operation owns a key; unregisters the lock when uncontended
pub(crate) struct KeyGuard {
    key: String,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = lock(&self.locks);
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    pub(crate) async fn acquire(&self, key: &str) -> KeyGuard {
        let guard = self.lock_for(key).lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard,
        }
    }

    /// Take the key only if no operation currently holds it
    pub(crate) fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let guard = self.lock_for(key).try_lock_owned().ok()?;
        Some(KeyGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
            guard,
        })
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        lock(&self.locks).len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = lock(&self.locks);
        // One reference in the map, one in this guard: nobody else is waiting.
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.guard)) <= 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<usize>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let call = |flights: Arc<SingleFlight<usize>>, runs: Arc<AtomicUsize>| async move {
            flights
                .run("k", move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    runs.fetch_add(1, Ordering::SeqCst) + 1
                })
                .await
        };

        let (a, b, c) = tokio::join!(
            call(Arc::clone(&flights), Arc::clone(&runs)),
            call(Arc::clone(&flights), Arc::clone(&runs)),
            call(Arc::clone(&flights), Arc::clone(&runs)),
        );

        assert_eq!((a, b, c), (1, 1, 1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        assert_eq!(flights.run("k", || async { 1 }).await, 1);
        assert_eq!(flights.run("k", || async { 2 }).await, 2);
        assert_eq!(flights.run("other", || async { 3 }).await, 3);
    }

    #[tokio::test]
    async fn test_key_lock_serializes_and_cleans_up() {
        let locks = KeyLocks::new();

        let guard = locks.acquire("k").await;
        assert!(locks.try_acquire("k").is_none());
        assert!(locks.try_acquire("other").is_some());
        drop(guard);

        assert_eq!(locks.registered(), 0);
        let again = locks.try_acquire("k");
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_waiter_keeps_lock_registered() {
        let locks = Arc::new(KeyLocks::new());
        let first = locks.acquire("k").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(locks.registered(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.registered(), 0);
    }
}
