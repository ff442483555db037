//! Account storage layer
//!
//! `AccountRepository` is the seam between the persistence worker and the
//! durable store; `SqliteAccountRepository` persists to the tables created by
//! `db::Database`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::error::PersistenceError;
use crate::models::{Category, QuotaBucket, Snapshot, UsageRecord};

// ============================================================================
// Repository Trait
// ============================================================================

/// Durable storage for account snapshots and usage history
///
/// Implementations must make `save` atomic: either the snapshot and all
/// usage records are stored, or nothing is.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Latest stored snapshot for a user, `None` if the user is unknown
    async fn load(&self, user_id: &str) -> Result<Option<Snapshot>, PersistenceError>;

    /// Store a snapshot and the usage records committed up to it
    ///
    /// A snapshot older than the stored one must not overwrite it.
    async fn save(&self, snapshot: &Snapshot, usage: &[UsageRecord]) -> Result<(), PersistenceError>;

    /// Most recent usage records, newest first
    async fn usage_history(&self, user_id: &str, limit: u32)
        -> Result<Vec<UsageRecord>, PersistenceError>;

    /// Total bytes used since the given instant
    async fn usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64, PersistenceError>;
}

// ============================================================================
// Database Row Types
// ============================================================================

/// Row of the `accounts` table
#[derive(Debug, Clone, FromRow)]
pub struct StoredAccount {
    pub user_id: String,
    pub balance_bytes: i64,
    pub version: i64,
    /// RFC 3339
    pub updated_at: String,
}

/// Row of the `account_buckets` table
#[derive(Debug, Clone, FromRow)]
pub struct StoredBucket {
    pub category: String,
    pub remaining_bytes: i64,
    pub priority_rank: i64,
}

/// Row of the `usage_history` table
#[derive(Debug, Clone, FromRow)]
pub struct StoredUsage {
    pub category: String,
    pub amount_bytes: i64,
    pub version: i64,
    /// Unix milliseconds
    pub recorded_at: i64,
}

impl StoredBucket {
    fn to_bucket(&self, user_id: &str) -> Result<QuotaBucket, PersistenceError> {
        let category = self
            .category
            .parse::<Category>()
            .map_err(|e| PersistenceError::corrupt(user_id, e))?;
        let remaining_bytes = from_i64(self.remaining_bytes)
            .ok_or_else(|| PersistenceError::corrupt(user_id, "negative remaining_bytes"))?;
        let priority_rank = u32::try_from(self.priority_rank)
            .map_err(|_| PersistenceError::corrupt(user_id, "priority_rank out of range"))?;

        Ok(QuotaBucket {
            category,
            remaining_bytes,
            priority_rank,
        })
    }
}

impl StoredUsage {
    /// Convert database row to UsageRecord
    ///
    /// Returns `None` if parsing fails for required fields.
    fn to_usage_record(&self) -> Option<UsageRecord> {
        Some(UsageRecord {
            category: self.category.parse().ok()?,
            amount_bytes: from_i64(self.amount_bytes)?,
            version: from_i64(self.version)?,
            recorded_at: DateTime::from_timestamp_millis(self.recorded_at)?,
        })
    }
}

fn from_i64(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

fn to_i64(value: u64, field: &str) -> Result<i64, PersistenceError> {
    i64::try_from(value)
        .map_err(|_| PersistenceError::OutOfRange(format!("{} = {}", field, value)))
}

/// Parse datetime string (supports both RFC3339 and NaiveDateTime formats)
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }

    log::warn!("[persist:sqlite] Failed to parse datetime: {}", s);
    None
}

// ============================================================================
// SqliteAccountRepository
// ============================================================================

/// SQLite-backed repository
#[derive(Clone)]
pub struct SqliteAccountRepository {
    pool: SqlitePool,
}

impl SqliteAccountRepository {
    /// Create a new repository with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for SqliteAccountRepository {
    async fn load(&self, user_id: &str) -> Result<Option<Snapshot>, PersistenceError> {
        let row = sqlx::query_as::<_, StoredAccount>(
            r#"
            SELECT user_id, balance_bytes, version, updated_at
            FROM accounts
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            log::debug!("[persist:sqlite] No stored account for {}", user_id);
            return Ok(None);
        };

        let bucket_rows = sqlx::query_as::<_, StoredBucket>(
            r#"
            SELECT category, remaining_bytes, priority_rank
            FROM account_buckets
            WHERE user_id = ?
            ORDER BY priority_rank ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let buckets = bucket_rows
            .iter()
            .map(|b| b.to_bucket(user_id))
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = Snapshot {
            user_id: row.user_id.clone(),
            balance_bytes: from_i64(row.balance_bytes)
                .ok_or_else(|| PersistenceError::corrupt(user_id, "negative balance_bytes"))?,
            buckets,
            version: from_i64(row.version)
                .ok_or_else(|| PersistenceError::corrupt(user_id, "negative version"))?,
            updated_at: parse_datetime(&row.updated_at)
                .ok_or_else(|| PersistenceError::corrupt(user_id, "unreadable updated_at"))?,
        };

        log::debug!(
            "[persist:sqlite] Loaded {} at version {}",
            user_id,
            snapshot.version
        );

        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot, usage: &[UsageRecord]) -> Result<(), PersistenceError> {
        // Range checks happen before the transaction opens
        let balance = to_i64(snapshot.balance_bytes, "balance_bytes")?;
        let version = to_i64(snapshot.version, "version")?;
        let buckets = snapshot
            .buckets
            .iter()
            .map(|b| -> Result<_, PersistenceError> {
                Ok((
                    b.category.as_str(),
                    to_i64(b.remaining_bytes, "remaining_bytes")?,
                    i64::from(b.priority_rank),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let usage_rows = usage
            .iter()
            .map(|u| -> Result<_, PersistenceError> {
                Ok((
                    u.category.as_str(),
                    to_i64(u.amount_bytes, "amount_bytes")?,
                    to_i64(u.version, "version")?,
                    u.recorded_at.timestamp_millis(),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            INSERT INTO accounts (user_id, balance_bytes, version, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                balance_bytes = excluded.balance_bytes,
                version = excluded.version,
                updated_at = excluded.updated_at
            WHERE excluded.version > accounts.version
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(balance)
        .bind(version)
        .bind(snapshot.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            log::warn!(
                "[persist:sqlite] Stored state for {} is newer than version {}, keeping it",
                snapshot.user_id,
                snapshot.version
            );
        } else {
            for (category, remaining, rank) in &buckets {
                sqlx::query(
                    r#"
                    INSERT INTO account_buckets (user_id, category, remaining_bytes, priority_rank)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(user_id, category) DO UPDATE SET
                        remaining_bytes = excluded.remaining_bytes,
                        priority_rank = excluded.priority_rank
                    "#,
                )
                .bind(&snapshot.user_id)
                .bind(*category)
                .bind(*remaining)
                .bind(*rank)
                .execute(&mut *tx)
                .await?;
            }
        }

        for (category, amount, usage_version, recorded_at) in &usage_rows {
            sqlx::query(
                r#"
                INSERT INTO usage_history (id, user_id, category, amount_bytes, version, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&snapshot.user_id)
            .bind(*category)
            .bind(*amount)
            .bind(*usage_version)
            .bind(*recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        log::debug!(
            "[persist:sqlite] Saved {} version {} with {} usage records",
            snapshot.user_id,
            snapshot.version,
            usage_rows.len()
        );

        Ok(())
    }

    async fn usage_history(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, StoredUsage>(
            r#"
            SELECT category, amount_bytes, version, recorded_at
            FROM usage_history
            WHERE user_id = ?
            ORDER BY recorded_at DESC, version DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(|row| row.to_usage_record()).collect())
    }

    async fn usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_bytes), 0)
            FROM usage_history
            WHERE user_id = ? AND recorded_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(from_i64(total).unwrap_or(0))
    }
}

// ============================================================================
// Tests
// ============================================================================
