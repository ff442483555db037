//! Background persistence worker
//!
//! Commits hand their snapshot to `enqueue`, which never blocks. A single
//! tokio task drains the queue, writes the newest snapshot of each batch
//! through the repository and retries transient failures with exponential
//! backoff. Failures never travel back to the committer; they surface in
//! `PersistenceHealth` instead.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::{Batch, PersistJob, PersistQueue, PushOutcome};
use super::repository::AccountRepository;
use crate::config::PersistenceConfig;
use crate::models::{Snapshot, UsageRecord};

// ============================================================================
// Health
// ============================================================================

/// Observable state of the persistence path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceHealth {
    /// Whether the worker task is still consuming the queue
    pub is_running: bool,
    /// Newest version known to be stored
    pub flushed_version: Option<u64>,
    /// Last successful flush (ISO 8601)
    pub last_flush_at: Option<String>,
    /// Last write error, cleared by the next successful flush
    pub last_error: Option<String>,
    /// Failed attempts since the last successful flush
    pub consecutive_failures: u32,
    /// Flushes abandoned after exhausting their retries
    pub failed_flushes: u64,
    /// Snapshots that were never written (abandoned or enqueued after close)
    pub dropped_snapshots: u64,
    /// Snapshots superseded by a newer one before being written
    pub coalesced_snapshots: u64,
    /// Usage records lost to the carry cap or an abandoned flush
    pub dropped_usage_records: u64,
}

impl PersistenceHealth {
    /// Running and the last flush did not fail
    pub fn is_healthy(&self) -> bool {
        self.is_running && self.last_error.is_none()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Handle to the background writer of one account
pub struct PersistenceWorker {
    queue: Arc<PersistQueue>,
    health: Arc<watch::Sender<PersistenceHealth>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWorker {
    /// Spawn the worker task on the current tokio runtime
    ///
    /// `flushed_version` is the version already in storage, if any.
    pub fn start(
        repository: Arc<dyn AccountRepository>,
        config: PersistenceConfig,
        flushed_version: Option<u64>,
    ) -> Self {
        let config = config.validate();
        let queue = Arc::new(PersistQueue::new(
            config.queue_capacity,
            config.max_carried_usage,
        ));
        let (health, _) = watch::channel(PersistenceHealth {
            is_running: true,
            flushed_version,
            ..Default::default()
        });
        let health = Arc::new(health);

        log::info!(
            "[persist] Starting worker (capacity {}, {} attempts)",
            config.queue_capacity,
            config.max_attempts
        );

        let handle = tokio::spawn(run(
            Arc::clone(&queue),
            repository,
            config,
            Arc::clone(&health),
        ));

        Self {
            queue,
            health,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Hand a committed snapshot to the worker without waiting
    pub fn enqueue(&self, snapshot: Snapshot, usage: Option<UsageRecord>) {
        let version = snapshot.version;
        match self.queue.push(PersistJob::new(snapshot, usage)) {
            PushOutcome::Queued => {
                log::debug!("[persist] Queued version {}", version);
            }
            PushOutcome::Coalesced {
                merged,
                dropped_usage,
            } => {
                log::debug!(
                    "[persist] Queue full, folded {} pending snapshots into version {}",
                    merged,
                    version
                );
                self.health.send_modify(|h| {
                    h.coalesced_snapshots += merged as u64;
                    h.dropped_usage_records += dropped_usage as u64;
                });
            }
            PushOutcome::Closed => {
                log::warn!("[persist] Worker closed, version {} not persisted", version);
                self.health.send_modify(|h| {
                    h.dropped_snapshots += 1;
                });
            }
        }
    }

    /// Current health
    pub fn health(&self) -> PersistenceHealth {
        self.health.borrow().clone()
    }

    /// Receiver that sees every health change
    pub fn subscribe_health(&self) -> watch::Receiver<PersistenceHealth> {
        self.health.subscribe()
    }

    /// Wait until the health satisfies `predicate`, up to `timeout`
    pub async fn wait_for_health<F>(&self, timeout: Duration, predicate: F) -> Option<PersistenceHealth>
    where
        F: FnMut(&PersistenceHealth) -> bool,
    {
        let mut rx = self.health.subscribe();
        let health = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(health)) => Some(health.clone()),
            _ => None,
        };
        health
    }

    /// Wait until `version` (or a newer one) is stored
    pub async fn wait_for_flush(&self, version: u64, timeout: Duration) -> bool {
        self.wait_for_health(timeout, |h| {
            h.flushed_version.is_some_and(|flushed| flushed >= version)
        })
        .await
        .is_some()
    }

    /// Number of jobs waiting to be written
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stop accepting work and wait until everything queued is written
    pub async fn shutdown(&self) {
        self.queue.close();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[persist] Worker task ended abnormally: {}", e);
                self.health.send_modify(|h| h.is_running = false);
            }
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        // The task drains what is left and exits
        self.queue.close();
    }
}

// ============================================================================
// Worker loop
// ============================================================================

async fn run(
    queue: Arc<PersistQueue>,
    repository: Arc<dyn AccountRepository>,
    config: PersistenceConfig,
    health: Arc<watch::Sender<PersistenceHealth>>,
) {
    while let Some(batch) = queue.next_batch().await {
        let Batch {
            job,
            merged,
            dropped_usage,
        } = batch;

        if merged > 1 || dropped_usage > 0 {
            health.send_modify(|h| {
                h.coalesced_snapshots += (merged - 1) as u64;
                h.dropped_usage_records += dropped_usage as u64;
            });
        }

        flush(repository.as_ref(), &config, &health, job).await;
    }

    log::info!("[persist] Queue closed and drained, worker stopping");
    health.send_modify(|h| h.is_running = false);
}

/// Write one job, retrying transient errors
async fn flush(
    repository: &dyn AccountRepository,
    config: &PersistenceConfig,
    health: &watch::Sender<PersistenceHealth>,
    job: PersistJob,
) {
    let version = job.snapshot.version;
    let mut delay = config.initial_backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match repository.save(&job.snapshot, &job.usage).await {
            Ok(()) => {
                log::debug!(
                    "[persist] Flushed version {} with {} usage records",
                    version,
                    job.usage.len()
                );
                health.send_modify(|h| {
                    h.flushed_version = Some(h.flushed_version.map_or(version, |v| v.max(version)));
                    h.last_flush_at = Some(chrono::Utc::now().to_rfc3339());
                    h.last_error = None;
                    h.consecutive_failures = 0;
                });
                return;
            }
            Err(e) => e,
        };

        health.send_modify(|h| {
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);
            h.last_error = Some(error.to_string());
        });

        if !error.is_retryable() || attempt >= config.max_attempts {
            log::error!(
                "[persist] Giving up on version {} after {} attempt(s): {}",
                version,
                attempt,
                error
            );
            health.send_modify(|h| {
                h.failed_flushes += 1;
                h.dropped_snapshots += 1;
                h.dropped_usage_records += job.usage.len() as u64;
            });
            return;
        }

        log::warn!(
            "[persist] Attempt {} for version {} failed, retrying in {:?}: {}",
            attempt,
            version,
            delay,
            error
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(config.max_backoff());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::models::{Category, QuotaBucket};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory repository that fails the first `fail_times` saves
    #[derive(Default)]
    struct FlakyRepository {
        fail_times: u32,
        permanent: bool,
        attempts: AtomicU32,
        saved: Mutex<Vec<(u64, usize)>>,
    }

    impl FlakyRepository {
        fn failing(fail_times: u32) -> Self {
            Self {
                fail_times,
                ..Default::default()
            }
        }

        fn saved_versions(&self) -> Vec<u64> {
            self.saved.lock().unwrap().iter().map(|(v, _)| *v).collect()
        }
    }

    #[async_trait]
    impl AccountRepository for FlakyRepository {
        async fn load(&self, _user_id: &str) -> Result<Option<Snapshot>, PersistenceError> {
            Ok(None)
        }

        async fn save(&self, snapshot: &Snapshot, usage: &[UsageRecord]) -> Result<(), PersistenceError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                return Err(if self.permanent {
                    PersistenceError::OutOfRange("balance_bytes".to_string())
                } else {
                    PersistenceError::Database(sqlx::Error::PoolTimedOut)
                });
            }
            self.saved
                .lock()
                .unwrap()
                .push((snapshot.version, usage.len()));
            Ok(())
        }

        async fn usage_history(&self, _user_id: &str, _limit: u32)
            -> Result<Vec<UsageRecord>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn usage_since(&self, _user_id: &str, _since: DateTime<Utc>) -> Result<u64, PersistenceError> {
            Ok(0)
        }
    }

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            user_id: "user-1".to_string(),
            balance_bytes: version,
            buckets: vec![QuotaBucket::new(Category::General, 0).with_remaining(version)],
            version,
            updated_at: Utc::now(),
        }
    }

    fn fast_config() -> PersistenceConfig {
        PersistenceConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_flushes_enqueued_snapshot() {
        let repo = Arc::new(FlakyRepository::default());
        let worker = PersistenceWorker::start(repo.clone(), fast_config(), None);

        worker.enqueue(snapshot(1), None);
        assert!(worker.wait_for_flush(1, WAIT).await);

        let health = worker.health();
        assert!(health.is_healthy());
        assert_eq!(health.flushed_version, Some(1));
        assert!(health.last_flush_at.is_some());
        assert_eq!(repo.saved_versions(), vec![1]);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let repo = Arc::new(FlakyRepository::failing(2));
        let worker = PersistenceWorker::start(repo.clone(), fast_config(), None);

        worker.enqueue(snapshot(1), None);
        assert!(worker.wait_for_flush(1, WAIT).await);

        let health = worker.health();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.failed_flushes, 0);
        assert!(health.last_error.is_none());
        assert_eq!(repo.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let repo = Arc::new(FlakyRepository::failing(u32::MAX));
        let config = PersistenceConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let worker = PersistenceWorker::start(repo.clone(), config, None);

        worker.enqueue(snapshot(1), None);
        let health = worker
            .wait_for_health(WAIT, |h| h.failed_flushes == 1)
            .await
            .expect("flush was not abandoned");

        assert!(!health.is_healthy());
        assert_eq!(health.dropped_snapshots, 1);
        assert_eq!(health.consecutive_failures, 3);
        assert!(health.last_error.is_some());
        assert_eq!(health.flushed_version, None);
        assert_eq!(repo.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_skips_retries() {
        let repo = Arc::new(FlakyRepository {
            fail_times: 1,
            permanent: true,
            ..Default::default()
        });
        let worker = PersistenceWorker::start(repo.clone(), fast_config(), None);

        worker.enqueue(snapshot(1), None);
        worker
            .wait_for_health(WAIT, |h| h.failed_flushes == 1)
            .await
            .expect("flush was not abandoned");
        assert_eq!(repo.attempts.load(Ordering::SeqCst), 1);

        // The next commit carries the full state and recovers
        worker.enqueue(snapshot(2), None);
        assert!(worker.wait_for_flush(2, WAIT).await);
        assert!(worker.health().last_error.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_health_times_out() {
        let repo = Arc::new(FlakyRepository::default());
        let worker = PersistenceWorker::start(repo, fast_config(), None);

        let health = worker
            .wait_for_health(Duration::from_millis(20), |h| h.failed_flushes > 0)
            .await;
        assert!(health.is_none());
        assert!(!worker.wait_for_flush(1, Duration::from_millis(20)).await);

        let running = worker.wait_for_health(WAIT, |h| h.is_running).await;
        assert_eq!(running.map(|h| h.flushed_version), Some(None));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let repo = Arc::new(FlakyRepository::default());
        let worker = PersistenceWorker::start(repo.clone(), fast_config(), Some(0));

        for version in 1..=20 {
            worker.enqueue(snapshot(version), None);
        }
        worker.shutdown().await;

        let health = worker.health();
        assert!(!health.is_running);
        assert_eq!(health.flushed_version, Some(20));
        assert_eq!(repo.saved_versions().last(), Some(&20));
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_reported() {
        let repo = Arc::new(FlakyRepository::default());
        let worker = PersistenceWorker::start(repo, fast_config(), None);
        worker.shutdown().await;

        worker.enqueue(snapshot(1), None);
        assert_eq!(worker.health().dropped_snapshots, 1);
    }

    #[tokio::test]
    async fn test_usage_records_travel_with_snapshot() {
        let repo = Arc::new(FlakyRepository::default());
        let worker = PersistenceWorker::start(repo.clone(), fast_config(), None);

        let usage = UsageRecord {
            category: Category::General,
            amount_bytes: 10,
            version: 1,
            recorded_at: Utc::now(),
        };
        worker.enqueue(snapshot(1), Some(usage));
        assert!(worker.wait_for_flush(1, WAIT).await);

        let saved = repo.saved.lock().unwrap().clone();
        let carried: usize = saved.iter().map(|(_, n)| n).sum();
        assert_eq!(carried, 1);
    }
}
