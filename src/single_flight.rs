//! Request coalescing: at most one in-flight origin call per key.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Flights<K, V> = Mutex<HashMap<K, (u64, Shared<BoxFuture<'static, V>>)>>;

/// Concurrent callers asking for the same key share the first caller's result.
///
/// The origin call runs on its own task. It finishes and clears its slot even if every
/// waiter goes away, so a cancelled leader never leaves a dead flight behind for the next
/// caller. Nothing is memoized once the call resolves.
pub struct SingleFlight<K, V> {
    flights: Arc<Flights<K, V>>,
    next_id: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self { flights: Arc::new(Mutex::new(HashMap::new())), next_id: AtomicU64::new(0) }
    }
}

impl<K, V> fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight").field("in_flight", &self.in_flight()).finish()
    }
}

impl<K, V> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys with an origin call currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().expect("single-flight map poisoned").len()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Run `origin` for `key` unless a call is already running, in which case wait for it.
    ///
    /// Returns the value and whether this caller started the origin call. Must be called
    /// from within a Tokio runtime.
    pub async fn run<F, Fut>(&self, key: K, origin: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, leader) = {
            let mut flights = self.flights.lock().expect("single-flight map poisoned");
            match flights.get(&key) {
                Some((_, shared)) => (shared.clone(), false),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::downgrade(&self.flights);
                    let slot = key.clone();
                    let call = origin();
                    let task = tokio::spawn(async move {
                        let value = call.await;
                        if let Some(registry) = registry.upgrade() {
                            let mut flights = registry.lock().expect("single-flight map poisoned");
                            if flights.get(&slot).is_some_and(|(current, _)| *current == id) {
                                flights.remove(&slot);
                            }
                        }
                        value
                    });
                    let shared = async move {
                        match task.await {
                            Ok(value) => value,
                            Err(err) => match err.try_into_panic() {
                                Ok(payload) => std::panic::resume_unwind(payload),
                                // Only reachable while the runtime shuts down.
                                Err(err) => panic!("single-flight origin task cancelled: {err}"),
                            },
                        }
                    }
                    .boxed()
                    .shared();
                    flights.insert(key, (id, shared.clone()));
                    (shared, true)
                }
            }
        };
        (flight.await, leader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_call() {
        let flight: Arc<SingleFlight<String, usize>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("GET https://example.org/feed".to_string(), move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        calls.fetch_add(1, Ordering::SeqCst) + 100
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (value, leader) = handle.await.unwrap();
            assert_eq!(value, 100);
            leaders += usize::from(leader);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn completed_calls_are_not_memoized() {
        let flight: SingleFlight<&'static str, u32> = SingleFlight::new();
        let (a, _) = flight.run("k", || async { 1 }).await;
        let (b, leader) = flight.run("k", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
        assert!(leader);
    }

    #[tokio::test]
    async fn follower_survives_cancelled_leader() {
        let flight: Arc<SingleFlight<&'static str, &'static str>> = Arc::new(SingleFlight::new());
        let leader = tokio::spawn({
            let flight = flight.clone();
            async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        "done"
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let follower = tokio::spawn({
            let flight = flight.clone();
            async move { flight.run("k", || async { "second origin" }).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.abort();

        let (value, was_leader) = follower.await.unwrap();
        assert_eq!(value, "done");
        assert!(!was_leader);
    }

    #[tokio::test]
    async fn abandoned_call_finishes_and_frees_its_slot() {
        let flight: Arc<SingleFlight<&'static str, usize>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let leader = tokio::spawn({
            let flight = flight.clone();
            let calls = calls.clone();
            async move {
                flight
                    .run("k", move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        calls.fetch_add(1, Ordering::SeqCst)
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        assert_eq!(flight.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);

        let (value, leader) = flight.run("k", || async { 7 }).await;
        assert_eq!(value, 7);
        assert!(leader);
    }
}
