//! Bounded coalescing queue between committers and the persistence worker
//!
//! Any number of producers push; one consumer takes batches. When the queue
//! is full, everything queued is folded into a single job carrying the newest
//! snapshot, so a stalled writer costs memory proportional to the capacity,
//! never to the commit rate.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::models::{Snapshot, UsageRecord};

/// Snapshot plus the usage records committed since the previous job
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub snapshot: Snapshot,
    pub usage: Vec<UsageRecord>,
}

impl PersistJob {
    pub fn new(snapshot: Snapshot, usage: Option<UsageRecord>) -> Self {
        Self {
            snapshot,
            usage: usage.into_iter().collect(),
        }
    }
}

/// Result of folding several jobs into one
#[derive(Debug)]
pub struct Batch {
    pub job: PersistJob,
    /// Jobs folded into `job` (1 means nothing was merged)
    pub merged: usize,
    /// Usage records discarded to respect the carry cap
    pub dropped_usage: usize,
}

/// What happened to a pushed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; `merged` queued jobs were folded with the new one
    Coalesced { merged: usize, dropped_usage: usize },
    /// The worker is shutting down; the job was discarded
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<PersistJob>,
    closed: bool,
}

/// Multi-producer, single-consumer coalescing queue
#[derive(Debug)]
pub struct PersistQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    max_carried_usage: usize,
}

impl PersistQueue {
    pub fn new(capacity: usize, max_carried_usage: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            max_carried_usage,
        }
    }

    /// Enqueue without blocking
    pub fn push(&self, job: PersistJob) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return PushOutcome::Closed;
            }

            if state.jobs.len() >= self.capacity {
                let merged = state.jobs.len();
                let batch = fold(job, state.jobs.drain(..), self.max_carried_usage);
                state.jobs.push_back(batch.job);
                PushOutcome::Coalesced {
                    merged,
                    dropped_usage: batch.dropped_usage,
                }
            } else {
                state.jobs.push_back(job);
                PushOutcome::Queued
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for work and take everything queued as one batch
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next_batch(&self) -> Option<Batch> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(first) = state.jobs.pop_front() {
                    return Some(fold(first, state.jobs.drain(..), self.max_carried_usage));
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting jobs; queued jobs are still handed out
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep the newest snapshot and the `cap` most recent usage records
fn fold(first: PersistJob, rest: impl Iterator<Item = PersistJob>, cap: usize) -> Batch {
    let PersistJob {
        snapshot: mut newest,
        mut usage,
    } = first;
    let mut merged = 1;

    for job in rest {
        merged += 1;
        usage.extend(job.usage);
        if job.snapshot.version > newest.version {
            newest = job.snapshot;
        }
    }

    usage.sort_by_key(|u| u.version);
    let dropped_usage = usage.len().saturating_sub(cap);
    if dropped_usage > 0 {
        usage.drain(..dropped_usage);
    }

    Batch {
        job: PersistJob {
            snapshot: newest,
            usage,
        },
        merged,
        dropped_usage,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, QuotaBucket};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(version: u64, usage_bytes: Option<u64>) -> PersistJob {
        let snapshot = Snapshot {
            user_id: "user-1".to_string(),
            balance_bytes: 0,
            buckets: vec![QuotaBucket::new(Category::General, 0)],
            version,
            updated_at: Utc::now(),
        };
        let usage = usage_bytes.map(|amount_bytes| UsageRecord {
            category: Category::General,
            amount_bytes,
            version,
            recorded_at: Utc::now(),
        });
        PersistJob::new(snapshot, usage)
    }

    #[test]
    fn test_push_below_capacity() {
        let queue = PersistQueue::new(4, 100);
        assert_eq!(queue.push(job(1, None)), PushOutcome::Queued);
        assert_eq!(queue.push(job(2, None)), PushOutcome::Queued);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_coalesces_to_latest() {
        let queue = PersistQueue::new(2, 100);
        queue.push(job(1, Some(10)));
        queue.push(job(2, Some(20)));

        let outcome = queue.push(job(3, Some(30)));
        assert_eq!(
            outcome,
            PushOutcome::Coalesced {
                merged: 2,
                dropped_usage: 0
            }
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = PersistQueue::new(2, 100);
        queue.close();
        assert_eq!(queue.push(job(1, None)), PushOutcome::Closed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fold_keeps_newest_and_caps_usage() {
        let rest = vec![job(3, Some(3)), job(2, Some(2))];
        let batch = fold(job(1, Some(1)), rest.into_iter(), 2);
        assert_eq!(batch.merged, 3);
        assert_eq!(batch.job.snapshot.version, 3);
        assert_eq!(batch.dropped_usage, 1);
        let kept: Vec<u64> = batch.job.usage.iter().map(|u| u.amount_bytes).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_next_batch_takes_everything() {
        let queue = PersistQueue::new(8, 100);
        queue.push(job(1, Some(5)));
        queue.push(job(2, None));
        queue.push(job(3, Some(7)));

        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.merged, 3);
        assert_eq!(batch.job.snapshot.version, 3);
        assert_eq!(batch.job.usage.len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_batch_wakes_on_push() {
        let queue = Arc::new(PersistQueue::new(8, 100));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_batch().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(job(9, None));

        let batch = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer timed out")
            .unwrap()
            .unwrap();
        assert_eq!(batch.job.snapshot.version, 9);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = PersistQueue::new(8, 100);
        queue.push(job(1, None));
        queue.close();

        assert!(queue.next_batch().await.is_some());
        assert!(queue.next_batch().await.is_none());
    }
}
