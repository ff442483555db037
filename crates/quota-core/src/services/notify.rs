//! Change notification
//!
//! Every commit publishes its snapshot here once the account guard has been
//! released. Publishing only replaces the latest value of a `watch` channel,
//! so it never waits on subscribers. Each subscriber owns a dispatch task
//! that delivers the newest snapshot it has not seen yet; snapshots that
//! arrive while a handler is still running are coalesced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::Snapshot;

/// Receives account snapshots after each commit
///
/// Handlers run on the blocking pool, one call at a time per subscriber.
/// A handler may call back into the store.
pub trait AccountUpdateHandler: Send + Sync + 'static {
    fn on_account_updated(&self, snapshot: &Snapshot);
}

impl<F> AccountUpdateHandler for F
where
    F: Fn(&Snapshot) + Send + Sync + 'static,
{
    fn on_account_updated(&self, snapshot: &Snapshot) {
        self(snapshot)
    }
}

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Fan-out of committed snapshots to subscribers
pub struct NotificationBus {
    tx: watch::Sender<Snapshot>,
    subscribers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_id: AtomicU64,
    runtime: Handle,
}

impl NotificationBus {
    /// Create a bus whose current value is `initial`
    ///
    /// Dispatch tasks are spawned on `runtime`, so `subscribe` also works
    /// from threads outside the runtime.
    pub fn new(initial: Snapshot, runtime: Handle) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            runtime,
        }
    }

    /// Register a handler; it first receives the current snapshot
    pub fn subscribe<H>(&self, handler: H) -> SubscriptionId
    where
        H: AccountUpdateHandler,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let rx = self.tx.subscribe();
        let task = self.runtime.spawn(dispatch(id, rx, Arc::new(handler)));

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);

        log::debug!("[notify] Subscriber {} registered", id.0);
        id
    }

    /// Remove a handler; returns false if the id is unknown
    ///
    /// A delivery already in progress finishes; no further ones start.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let task = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match task {
            Some(task) => {
                task.abort();
                log::debug!("[notify] Subscriber {} removed", id.0);
                true
            }
            None => false,
        }
    }

    /// Offer a snapshot to all subscribers
    ///
    /// Snapshots not newer than the last published one are dropped, so
    /// racing publishers cannot make a subscriber go backwards. Returns
    /// whether the snapshot was accepted.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        self.tx.send_if_modified(|current| {
            if snapshot.version > current.version {
                *current = snapshot;
                true
            } else {
                false
            }
        })
    }

    /// Most recently published snapshot
    pub fn latest(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for NotificationBus {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, task) in subscribers.drain() {
            task.abort();
        }
    }
}

async fn dispatch(
    id: SubscriptionId,
    mut rx: watch::Receiver<Snapshot>,
    handler: Arc<dyn AccountUpdateHandler>,
) {
    let mut delivered: Option<u64> = None;

    loop {
        let snapshot = rx.borrow_and_update().clone();
        let version = snapshot.version;

        if delivered.map_or(true, |last| version > last) {
            let handler = Arc::clone(&handler);
            let outcome =
                tokio::task::spawn_blocking(move || handler.on_account_updated(&snapshot)).await;

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    log::warn!(
                        "[notify] Subscriber {} panicked on version {}, keeping it registered",
                        id.0,
                        version
                    );
                }
                Err(_) => return,
            }
            delivered = Some(version);
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
