//! Engine configuration
//!
//! Loaded from a JSON file when one is given; every field has a default so
//! a partial file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{validate_layout, Category, QuotaBucket};

// ============================================================================
// Constants
// ============================================================================

/// Default capacity of the persistence queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Smallest accepted queue capacity
pub const MIN_QUEUE_CAPACITY: usize = 1;

/// Default number of write attempts per flush
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first retry delay
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;

/// Default retry delay ceiling
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

/// Default cap on usage records carried through coalescing
pub const DEFAULT_MAX_CARRIED_USAGE: usize = 4096;

/// Default forecast window
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// Longest accepted forecast window (about ten years)
pub const MAX_WINDOW_DAYS: u32 = 3650;

/// Default "top up soon" threshold
pub const DEFAULT_LOW_BALANCE_DAYS: u64 = 3;

// ============================================================================
// Buckets
// ============================================================================

/// One entry of the bucket layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub category: Category,
    pub priority_rank: u32,
    /// Balance a fresh account starts with
    #[serde(default)]
    pub initial_bytes: u64,
}

fn default_buckets() -> Vec<BucketSpec> {
    Category::ALL
        .iter()
        .enumerate()
        .map(|(rank, category)| BucketSpec {
            category: *category,
            priority_rank: rank as u32,
            initial_bytes: 0,
        })
        .collect()
}

// ============================================================================
// Persistence
// ============================================================================

/// Tuning for the background writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Bounded queue size before coalescing kicks in
    pub queue_capacity: usize,
    /// Write attempts per flush, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Usage records kept when queued snapshots are coalesced
    pub max_carried_usage: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_carried_usage: DEFAULT_MAX_CARRIED_USAGE,
        }
    }
}

impl PersistenceConfig {
    /// Validate and normalize the configuration
    pub fn validate(&self) -> Self {
        let initial_backoff_ms = self.initial_backoff_ms.max(1);
        Self {
            queue_capacity: self.queue_capacity.max(MIN_QUEUE_CAPACITY),
            max_attempts: self.max_attempts.max(1),
            initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms.max(initial_backoff_ms),
            max_carried_usage: self.max_carried_usage,
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// ============================================================================
// Insight
// ============================================================================

/// Tuning for the balance forecast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Days of usage history averaged
    pub window_days: u32,
    /// Recommend a top-up below this many days left
    pub low_balance_days: u64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            low_balance_days: DEFAULT_LOW_BALANCE_DAYS,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bucket layout for fresh accounts
    pub buckets: Vec<BucketSpec>,
    pub persistence: PersistenceConfig,
    pub insight: InsightConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
            persistence: PersistenceConfig::default(),
            insight: InsightConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("[config] No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        log::info!("[config] Loaded config from {}", path.display());
        config.validate()
    }

    /// Validate and normalize the configuration
    ///
    /// The bucket layout is a hard requirement; tuning values are clamped.
    pub fn validate(&self) -> Result<Self> {
        let layout = validate_layout(self.layout())?;
        let buckets = layout
            .iter()
            .map(|b| BucketSpec {
                category: b.category,
                priority_rank: b.priority_rank,
                initial_bytes: b.remaining_bytes,
            })
            .collect();

        Ok(Self {
            buckets,
            persistence: self.persistence.validate(),
            insight: InsightConfig {
                window_days: self.insight.window_days.clamp(1, MAX_WINDOW_DAYS),
                low_balance_days: self.insight.low_balance_days,
            },
        })
    }

    /// Bucket set a fresh account starts with
    pub fn layout(&self) -> Vec<QuotaBucket> {
        self.buckets
            .iter()
            .map(|spec| {
                QuotaBucket::new(spec.category, spec.priority_rank).with_remaining(spec.initial_bytes)
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
