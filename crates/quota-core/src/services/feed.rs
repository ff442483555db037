//! Usage feed
//!
//! Bridges an external traffic sensor to the account store. The sensor side
//! sends `UsageEvent`s over an mpsc channel; `TrafficCounter` turns the
//! cumulative byte counters that network interfaces expose into per-sample
//! deltas.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::account::AccountStore;
use crate::models::Category;

/// Bytes consumed by one category since the previous event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub category: Category,
    pub amount_bytes: u64,
}

/// Outcome counts of a finished feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStats {
    pub applied: u64,
    pub rejected: u64,
    /// Zero-byte events, ignored
    pub skipped: u64,
}

/// Apply events until every sender is dropped
///
/// Rejected events (for example insufficient balance) are logged and the
/// feed keeps going.
pub fn spawn_usage_feed(
    store: Arc<AccountStore>,
    mut receiver: mpsc::Receiver<UsageEvent>,
) -> JoinHandle<FeedStats> {
    tokio::spawn(async move {
        let mut stats = FeedStats::default();
        log::info!("[feed] Usage feed started for {}", store.user_id());

        while let Some(event) = receiver.recv().await {
            if event.amount_bytes == 0 {
                stats.skipped += 1;
                continue;
            }

            match store.record_usage(event.category, event.amount_bytes) {
                Ok(snapshot) => {
                    stats.applied += 1;
                    log::debug!(
                        "[feed] {} bytes of {} applied, version {}",
                        event.amount_bytes,
                        event.category,
                        snapshot.version
                    );
                }
                Err(e) => {
                    stats.rejected += 1;
                    log::warn!(
                        "[feed] Rejected {} bytes of {} usage: {}",
                        event.amount_bytes,
                        event.category,
                        e
                    );
                }
            }
        }

        log::info!(
            "[feed] Usage feed closed ({} applied, {} rejected, {} skipped)",
            stats.applied,
            stats.rejected,
            stats.skipped
        );
        stats
    })
}

/// Converts a cumulative byte counter into deltas
#[derive(Debug, Clone, Default)]
pub struct TrafficCounter {
    last: Option<u64>,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next counter reading
    ///
    /// Returns the bytes since the previous reading. The first reading only
    /// establishes the baseline and a counter that went backwards (interface
    /// reset) starts a new one; neither yields a delta.
    pub fn observe(&mut self, cumulative: u64) -> Option<u64> {
        let previous = self.last.replace(cumulative)?;
        match cumulative.checked_sub(previous) {
            Some(0) => None,
            Some(delta) => Some(delta),
            None => {
                log::debug!(
                    "[feed] Counter went from {} to {}, treating as reset",
                    previous,
                    cumulative
                );
                None
            }
        }
    }

    /// `observe`, packaged as an event for `category`
    pub fn observe_event(&mut self, category: Category, cumulative: u64) -> Option<UsageEvent> {
        self.observe(cumulative).map(|amount_bytes| UsageEvent {
            category,
            amount_bytes,
        })
    }
}
