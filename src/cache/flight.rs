//! Single-flight coalescing of concurrent loads.
//!
//! The first caller for a key spawns the load as its own task; callers that
//! arrive while it runs subscribe to the same result. Dropping a caller never
//! cancels the load for the others.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::keys::CacheKey;

type Slot<T> = watch::Receiver<Option<T>>;

pub struct FlightGroup<T> {
    calls: Arc<DashMap<CacheKey, Slot<T>>>,
}

impl<T> Default for FlightGroup<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
        }
    }
}

impl<T> FlightGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loads currently in flight.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Run `load` for `key`, or join the load already in flight.
    ///
    /// Returns `None` only if the load task panicked or was aborted.
    pub async fn run<F, Fut>(&self, key: &CacheKey, load: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = match self.calls.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());

                let guard = FlightGuard {
                    key: key.clone(),
                    calls: Arc::clone(&self.calls),
                };
                let task = load();
                tokio::spawn(async move {
                    let output = task.await;
                    drop(guard);
                    let _ = tx.send(Some(output));
                });
                rx
            }
        };

        slot.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|output| output.clone())
    }
}

/// Frees the key once its load finished, also when the task unwinds.
struct FlightGuard<T> {
    key: CacheKey,
    calls: Arc<DashMap<CacheKey, Slot<T>>>,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.calls.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let group = Arc::new(FlightGroup::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("shared");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run(&key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.expect("caller task"), Some(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn sequential_calls_load_again() {
        let group = FlightGroup::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("k");

        for expected in 1..=2 {
            let counter = Arc::clone(&calls);
            let output = group
                .run(&key, move || async move { counter.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(output, Some(expected));
        }
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_shared_load() {
        let group = Arc::new(FlightGroup::<&'static str>::new());
        let key = CacheKey::new("k");
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let group = Arc::clone(&group);
            let key = key.clone();
            tokio::spawn(async move {
                group
                    .run(&key, move || async move {
                        let _ = release_rx.await;
                        "loaded"
                    })
                    .await
            })
        };
        while group.is_empty() {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let _ = leader.await;
        assert!(!group.is_empty());

        let (output, _) = tokio::join!(group.run(&key, || async { "second load" }), async {
            release_tx.send(())
        });
        assert_eq!(output, Some("loaded"));
    }

    fn explode() -> u32 {
        panic!("load failed hard");
    }

    #[tokio::test]
    async fn panicking_load_yields_none_and_frees_key() {
        let group = FlightGroup::<u32>::new();
        let key = CacheKey::new("boom");

        let output = group.run(&key, || async { explode() }).await;
        assert_eq!(output, None);
        assert!(group.is_empty());

        assert_eq!(group.run(&key, || async { 1 }).await, Some(1));
    }
}
