//! Data models for the quota engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, QuotaError, Result};

// ============================================================================
// Category
// ============================================================================

/// Bucket category
///
/// The set is closed; `General` is the catch-all bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Video,
    Social,
    General,
}

impl Category {
    /// Every category, in default priority order
    pub const ALL: [Category; 3] = [Category::Video, Category::Social, Category::General];

    /// Resolve a user-facing alias ("YouTube", "TikTok", ...) to a category
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias.trim().to_lowercase().as_str() {
            "video" | "youtube" | "yt" | "netflix" | "streaming" => Some(Category::Video),
            "social" | "instagram" | "ig" | "tiktok" | "facebook" | "whatsapp" | "twitter" => {
                Some(Category::Social)
            }
            "general" | "data" | "internet" => Some(Category::General),
            _ => None,
        }
    }

    /// Storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Video => "video",
            Category::Social => "social",
            Category::General => "general",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "video" => Ok(Category::Video),
            "social" => Ok(Category::Social),
            "general" => Ok(Category::General),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

// ============================================================================
// Buckets
// ============================================================================

/// A quota allotment for one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBucket {
    pub category: Category,
    pub remaining_bytes: u64,
    /// Lower rank is served first
    pub priority_rank: u32,
}

impl QuotaBucket {
    /// Create an empty bucket
    pub fn new(category: Category, priority_rank: u32) -> Self {
        Self {
            category,
            remaining_bytes: 0,
            priority_rank,
        }
    }

    /// Builder-style initial balance
    pub fn with_remaining(mut self, remaining_bytes: u64) -> Self {
        self.remaining_bytes = remaining_bytes;
        self
    }
}

/// Sort buckets by rank and check the layout is complete and unambiguous
///
/// Every category must appear exactly once, ranks must be distinct and
/// `General` must be ranked last so it catches overflow from every bucket.
pub fn validate_layout(mut buckets: Vec<QuotaBucket>) -> Result<Vec<QuotaBucket>> {
    buckets.sort_by_key(|b| b.priority_rank);

    for pair in buckets.windows(2) {
        if pair[0].priority_rank == pair[1].priority_rank {
            return Err(Error::config(format!(
                "duplicate priority rank {} ({} and {})",
                pair[0].priority_rank, pair[0].category, pair[1].category
            )));
        }
    }

    for category in Category::ALL {
        let count = buckets.iter().filter(|b| b.category == category).count();
        if count != 1 {
            return Err(Error::config(format!(
                "bucket layout must contain exactly one {} bucket (found {})",
                category, count
            )));
        }
    }

    if buckets.last().map(|b| b.category) != Some(Category::General) {
        return Err(Error::config(
            "the general bucket must have the lowest priority (highest rank)",
        ));
    }

    Ok(buckets)
}

/// Sum of remaining bytes, `None` on overflow
pub fn total_remaining(buckets: &[QuotaBucket]) -> Option<u64> {
    buckets
        .iter()
        .try_fold(0u64, |acc, b| acc.checked_add(b.remaining_bytes))
}

// ============================================================================
// Intents and usage
// ============================================================================

/// Structured form of a command or usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedIntent {
    TopUp { category: Category, amount_bytes: u64 },
    UsageEvent { category: Category, amount_bytes: u64 },
}

/// One committed usage event, kept as history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub category: Category,
    pub amount_bytes: u64,
    /// Version of the commit that consumed the bytes
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Account and snapshots
// ============================================================================

/// Immutable, versioned copy of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub user_id: String,
    pub balance_bytes: u64,
    pub buckets: Vec<QuotaBucket>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Remaining bytes of one category's bucket
    pub fn remaining(&self, category: Category) -> Option<u64> {
        self.buckets
            .iter()
            .find(|b| b.category == category)
            .map(|b| b.remaining_bytes)
    }
}

/// Canonical mutable account state
///
/// Only `AccountStore` holds one of these; everyone else sees snapshots.
#[derive(Debug, Clone)]
pub struct Account {
    user_id: String,
    balance_bytes: u64,
    buckets: Vec<QuotaBucket>,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account at version 0 with the given bucket layout
    pub fn new(user_id: impl Into<String>, layout: Vec<QuotaBucket>) -> Result<Self> {
        let buckets = validate_layout(layout)?;
        let balance_bytes = total_remaining(&buckets)
            .ok_or_else(|| Error::config("initial bucket balances overflow"))?;

        Ok(Self {
            user_id: user_id.into(),
            balance_bytes,
            buckets,
            version: 0,
            updated_at: Utc::now(),
        })
    }

    /// Rebuild an account from a persisted snapshot
    ///
    /// The balance is re-derived from the buckets.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let buckets = validate_layout(snapshot.buckets)?;
        let balance_bytes = total_remaining(&buckets)
            .ok_or_else(|| Error::internal("persisted bucket balances overflow"))?;

        if balance_bytes != snapshot.balance_bytes {
            log::warn!(
                "[account] Stored balance {} for {} disagrees with bucket sum {}, using the sum",
                snapshot.balance_bytes,
                snapshot.user_id,
                balance_bytes
            );
        }

        Ok(Self {
            user_id: snapshot.user_id,
            balance_bytes,
            buckets,
            version: snapshot.version,
            updated_at: snapshot.updated_at,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn balance_bytes(&self) -> u64 {
        self.balance_bytes
    }

    pub fn buckets(&self) -> &[QuotaBucket] {
        &self.buckets
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Install a new bucket set computed by the ledger and bump the version
    ///
    /// The new set must keep the same categories in the same order.
    pub(crate) fn commit(&mut self, buckets: Vec<QuotaBucket>) -> std::result::Result<(), QuotaError> {
        debug_assert!(buckets
            .iter()
            .zip(&self.buckets)
            .all(|(new, old)| new.category == old.category && new.priority_rank == old.priority_rank));

        let version = self.version.checked_add(1).ok_or(QuotaError::Overflow)?;
        let balance_bytes = total_remaining(&buckets).ok_or(QuotaError::Overflow)?;

        self.buckets = buckets;
        self.balance_bytes = balance_bytes;
        self.version = version;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Immutable copy of the current state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            user_id: self.user_id.clone(),
            balance_bytes: self.balance_bytes,
            buckets: self.buckets.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn default_layout() -> Vec<QuotaBucket> {
        vec![
            QuotaBucket::new(Category::Video, 0),
            QuotaBucket::new(Category::Social, 1),
            QuotaBucket::new(Category::General, 2),
        ]
    }

    #[test]
    fn test_category_aliases() {
        assert_eq!(Category::from_alias("YouTube"), Some(Category::Video));
        assert_eq!(Category::from_alias("tiktok"), Some(Category::Social));
        assert_eq!(Category::from_alias("Instagram"), Some(Category::Social));
        assert_eq!(Category::from_alias(" General "), Some(Category::General));
        assert_eq!(Category::from_alias("myspace"), None);
    }

    #[test]
    fn test_category_round_trips_through_storage_name() {
        for category in Category::ALL {
            assert_eq!(category.to_string().parse::<Category>(), Ok(category));
        }
        assert!("youtube".parse::<Category>().is_err());
    }

    #[test]
    fn test_validate_layout_sorts_by_rank() {
        let layout = vec![
            QuotaBucket::new(Category::General, 9),
            QuotaBucket::new(Category::Video, 1),
            QuotaBucket::new(Category::Social, 5),
        ];
        let sorted = validate_layout(layout).unwrap();
        let order: Vec<Category> = sorted.iter().map(|b| b.category).collect();
        assert_eq!(order, vec![Category::Video, Category::Social, Category::General]);
    }

    #[test]
    fn test_validate_layout_rejects_duplicate_rank() {
        let layout = vec![
            QuotaBucket::new(Category::Video, 0),
            QuotaBucket::new(Category::Social, 0),
            QuotaBucket::new(Category::General, 2),
        ];
        assert!(matches!(validate_layout(layout), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_layout_rejects_missing_category() {
        let layout = vec![
            QuotaBucket::new(Category::Video, 0),
            QuotaBucket::new(Category::General, 1),
        ];
        assert!(matches!(validate_layout(layout), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_layout_requires_general_last() {
        let layout = vec![
            QuotaBucket::new(Category::General, 0),
            QuotaBucket::new(Category::Video, 1),
            QuotaBucket::new(Category::Social, 2),
        ];
        assert!(matches!(validate_layout(layout.clone()), Err(Error::Config(_))));
        assert!(Account::new("user-1", layout).is_err());

        let layout = vec![
            QuotaBucket::new(Category::Social, 0),
            QuotaBucket::new(Category::General, 7),
            QuotaBucket::new(Category::Video, 3),
        ];
        let sorted = validate_layout(layout).unwrap();
        assert_eq!(sorted.last().map(|b| b.category), Some(Category::General));
    }

    #[test]
    fn test_new_account_is_empty() {
        let account = Account::new("user-1", default_layout()).unwrap();
        assert_eq!(account.user_id(), "user-1");
        assert_eq!(account.balance_bytes(), 0);
        assert_eq!(account.version(), 0);
        assert_eq!(account.buckets().len(), 3);
    }

    #[test]
    fn test_commit_bumps_version_and_balance() {
        let mut account = Account::new("user-1", default_layout()).unwrap();
        let mut buckets = account.buckets().to_vec();
        buckets[0].remaining_bytes = 40;
        buckets[2].remaining_bytes = 2;

        account.commit(buckets).unwrap();

        let snapshot = account.snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.balance_bytes, 42);
        assert_eq!(snapshot.remaining(Category::Video), Some(40));
    }

    #[test]
    fn test_from_snapshot_rederives_balance() {
        let snapshot = Snapshot {
            user_id: "user-1".to_string(),
            balance_bytes: 999,
            buckets: vec![
                QuotaBucket::new(Category::Video, 0).with_remaining(10),
                QuotaBucket::new(Category::Social, 1).with_remaining(5),
                QuotaBucket::new(Category::General, 2),
            ],
            version: 7,
            updated_at: Utc::now(),
        };

        let account = Account::from_snapshot(snapshot).unwrap();
        assert_eq!(account.balance_bytes(), 15);
        assert_eq!(account.version(), 7);
    }

    #[test]
    fn test_intent_serialization() {
        let intent = ParsedIntent::TopUp {
            category: Category::Video,
            amount_bytes: 1024,
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert!(json.contains(r#""kind":"top_up""#));
        assert!(json.contains(r#""category":"video""#));
    }
}
