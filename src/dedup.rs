//! In-process coalescing of identical in-flight lookups.
//!
//! External whois/proxy lookups are slow and registries rate-limit
//! aggressively, so concurrent callers asking about the same key must
//! share a single underlying invocation. The first caller for a key runs
//! the future; everyone else awaits its result. Entries are removed once
//! settled, optionally after a short grace period that lets bursts landing
//! right behind a slow lookup reuse the fresh result.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Slot state observed by joiners.
#[derive(Debug, Clone)]
enum Slot<T> {
    Pending,
    Done(Option<T>),
}

/// Request de-duplication queue, generic over the result type.
///
/// Lookup results are `Option<T>` because the clients already express
/// failure as absence; a shared failure is shared like any other result.
#[derive(Debug)]
pub struct Dedup<T> {
    inflight: Arc<DashMap<String, watch::Receiver<Slot<T>>>>,
    grace: Duration,
}

impl<T> Clone for Dedup<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
            grace: self.grace,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Dedup<T> {
    /// Create a queue whose settled results evaporate immediately.
    pub fn new() -> Self {
        Self::with_grace(Duration::ZERO)
    }

    /// Create a queue that keeps settled results for `grace` before
    /// evicting, absorbing request bursts behind a slow lookup.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            grace,
        }
    }

    /// Run `work` under `key`, or attach to the invocation already in
    /// flight for that key.
    ///
    /// If the leading caller is cancelled mid-flight, joiners observe the
    /// closed channel and get `None`; the next call re-runs.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let tx = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                let mut rx = entry.get().clone();
                drop(entry);
                debug!(key = %key, "Joining in-flight lookup");
                return Self::await_slot(&mut rx).await;
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(Slot::Pending);
                entry.insert(rx);
                tx
            }
        };

        // Leader path. The guard evicts the entry even if we are dropped
        // before settling, so joiners can't wait on a dead slot forever.
        let guard = EvictGuard {
            inflight: self.inflight.clone(),
            key: key.to_string(),
            grace: self.grace,
            armed: true,
        };

        let result = work().await;
        let _ = tx.send(Slot::Done(result.clone()));
        guard.settle();
        result
    }

    async fn await_slot(rx: &mut watch::Receiver<Slot<T>>) -> Option<T> {
        loop {
            if let Slot::Done(value) = &*rx.borrow() {
                return value.clone();
            }
            // Channel closure means the leader went away without settling.
            rx.changed().await.ok()?;
        }
    }

    /// Number of keys currently tracked.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Dedup<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry on drop, or after the grace period once
/// the result has settled.
struct EvictGuard<T> {
    inflight: Arc<DashMap<String, watch::Receiver<Slot<T>>>>,
    key: String,
    grace: Duration,
    armed: bool,
}

impl<T: Clone + Send + Sync + 'static> EvictGuard<T> {
    fn settle(mut self) {
        self.armed = false;
        if self.grace.is_zero() {
            self.inflight.remove(&self.key);
            return;
        }
        let inflight = self.inflight.clone();
        let key = std::mem::take(&mut self.key);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            inflight.remove(&key);
        });
    }
}

impl<T> Drop for EvictGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.remove(&self.key);
        }
    }
}
