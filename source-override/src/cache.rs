use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::watch;

/// A memoizing map with single-flight semantics: at most one resolution is
/// in flight per key, followers share the leader's outcome, and distinct
/// keys proceed independently.
///
/// Errors are handed to the callers waiting on the in-flight resolution but
/// are never cached, so a later call retries. A leader that is cancelled
/// mid-resolution publishes nothing; its pending slot is garbage-collected
/// by the next caller for that key.
pub(crate) struct SingleFlight<K, V, E> {
    slots: Mutex<HashMap<K, Slot<V, E>>>,
}

enum Slot<V, E> {
    Ready(V),
    Pending(watch::Receiver<Option<Result<V, E>>>),
}

// === impl SingleFlight ===

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Clone + Eq + Hash,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `key`, waits on an in-flight resolution,
    /// or becomes the leader and runs `init`.
    pub async fn get_or_resolve<F, Fut>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut init = Some(init);
        loop {
            let pending = {
                let mut slots = self.slots.lock();
                match slots.get(key) {
                    Some(Slot::Ready(v)) => return Ok(v.clone()),
                    Some(Slot::Pending(rx)) => Some(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(key.clone(), Slot::Pending(rx));
                        drop(slots);

                        // Leader: resolve and publish. The sender is dropped
                        // if this future is cancelled, waking followers.
                        let init = init.take().expect("a caller leads at most once");
                        let res = init().await;
                        {
                            let mut slots = self.slots.lock();
                            match &res {
                                Ok(v) => {
                                    slots.insert(key.clone(), Slot::Ready(v.clone()));
                                }
                                Err(_) => {
                                    slots.remove(key);
                                }
                            }
                        }
                        let _ = tx.send(Some(res.clone()));
                        return res;
                    }
                }
            };

            if let Some(mut rx) = pending {
                // Follower: wait for the leader to publish.
                let lost_leader = loop {
                    if let Some(res) = rx.borrow().clone() {
                        return res;
                    }
                    if rx.changed().await.is_err() {
                        break true;
                    }
                };
                if lost_leader {
                    // The leader was cancelled before publishing. Drop its
                    // stale slot (unless a new leader already replaced it)
                    // and race to lead.
                    let mut slots = self.slots.lock();
                    if let Some(Slot::Pending(cur)) = slots.get(key) {
                        if cur.has_changed().is_err() {
                            slots.remove(key);
                        }
                    }
                }
            }
        }
    }

    /// Removes and returns every completed entry. In-flight resolutions are
    /// left alone. Calling this twice is a no-op the second time.
    pub fn take_ready(&self) -> Vec<V> {
        let mut slots = self.slots.lock();
        let keys: Vec<K> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| match slots.remove(&k) {
                Some(Slot::Ready(v)) => Some(v),
                Some(pending @ Slot::Pending(_)) => {
                    slots.insert(k, pending);
                    None
                }
                None => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_resolution() {
        let cache = Arc::new(SingleFlight::<String, String, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(&"k".to_string(), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("v".to_string())
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = SingleFlight::<u32, u32, String>::new();
        let calls = AtomicUsize::new(0);

        let err = cache
            .get_or_resolve(&1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let ok = cache
            .get_or_resolve(&1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn followers_receive_the_leaders_error() {
        let cache = Arc::new(SingleFlight::<u32, u32, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(&1, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Err::<u32, _>("boom".to_string())
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap_err(), "boom");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_wedge_the_key() {
        let cache = Arc::new(SingleFlight::<u32, u32, String>::new());

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_resolve(&1, || async {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        Ok(0)
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        leader.abort();
        let _ = leader.await;

        let got = cache
            .get_or_resolve(&1, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(got, 42);
    }

    #[tokio::test]
    async fn take_ready_drains_once() {
        let cache = SingleFlight::<u32, u32, String>::new();
        cache.get_or_resolve(&1, || async { Ok(10) }).await.unwrap();
        cache.get_or_resolve(&2, || async { Ok(20) }).await.unwrap();

        let mut drained = cache.take_ready();
        drained.sort_unstable();
        assert_eq!(drained, vec![10, 20]);
        assert!(cache.take_ready().is_empty());
    }
}
