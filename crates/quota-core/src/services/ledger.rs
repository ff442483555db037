//! Quota ledger
//!
//! Pure bucket arithmetic: top-ups and cascading usage deduction. Nothing
//! here touches shared state; `AccountStore` calls these functions inside
//! its critical section and commits the returned bucket set.
//!
//! # Cascading deduction
//!
//! ```text
//!  usage(Video, 120MB)
//!        │
//!        ▼
//!  ┌──────────┐ rest ┌──────────┐ rest ┌──────────┐
//!  │ Video    │ ───▶ │ Social   │ ───▶ │ General  │
//!  │ rank 0   │      │ rank 1   │      │ rank 2   │
//!  └──────────┘      └──────────┘      └──────────┘
//! ```
//!
//! Deduction starts at the tagged bucket and spills into the buckets that
//! follow it in priority order. Buckets ranked above the tagged one are
//! never touched. When the eligible buckets cannot cover the amount the
//! input set is returned untouched together with an error.

use crate::error::QuotaError;
use crate::models::{total_remaining, Category, QuotaBucket};

/// Largest balance an account may hold
///
/// Balances are stored as SQLite `INTEGER`s, so the aggregate is capped at
/// `i64::MAX` rather than `u64::MAX`.
pub const MAX_BALANCE_BYTES: u64 = i64::MAX as u64;

/// Bytes taken from one bucket by a usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deduction {
    pub category: Category,
    pub amount_bytes: u64,
}

/// Add `amount` to the bucket of `category`
pub fn apply_topup(
    buckets: &[QuotaBucket],
    category: Category,
    amount: u64,
) -> Result<Vec<QuotaBucket>, QuotaError> {
    if amount == 0 {
        return Err(QuotaError::ZeroAmount);
    }

    let index = position_of(buckets, category)?;

    // The aggregate balance has to stay storable, not just the bucket.
    let total = total_remaining(buckets).ok_or(QuotaError::Overflow)?;
    match total.checked_add(amount) {
        Some(new_total) if new_total <= MAX_BALANCE_BYTES => {}
        _ => return Err(QuotaError::Overflow),
    }

    let mut updated = buckets.to_vec();
    updated[index].remaining_bytes = updated[index]
        .remaining_bytes
        .checked_add(amount)
        .ok_or(QuotaError::Overflow)?;

    Ok(updated)
}

/// Work out which buckets a usage event would drain, without applying it
pub fn plan_usage(
    buckets: &[QuotaBucket],
    category: Category,
    amount: u64,
) -> Result<Vec<Deduction>, QuotaError> {
    if amount == 0 {
        return Err(QuotaError::ZeroAmount);
    }

    let start = position_of(buckets, category)?;
    let eligible = &buckets[start..];

    let mut plan = Vec::with_capacity(eligible.len());
    let mut outstanding = amount;

    for bucket in eligible {
        if outstanding == 0 {
            break;
        }
        let take = bucket.remaining_bytes.min(outstanding);
        if take > 0 {
            plan.push(Deduction {
                category: bucket.category,
                amount_bytes: take,
            });
            outstanding -= take;
        }
    }

    if outstanding > 0 {
        let available = eligible
            .iter()
            .fold(0u64, |acc, b| acc.saturating_add(b.remaining_bytes));
        return Err(QuotaError::InsufficientBalance {
            requested: amount,
            available,
        });
    }

    Ok(plan)
}

/// Deduct `amount` starting at the bucket of `category`, cascading down
pub fn apply_usage(
    buckets: &[QuotaBucket],
    category: Category,
    amount: u64,
) -> Result<Vec<QuotaBucket>, QuotaError> {
    let plan = plan_usage(buckets, category, amount)?;

    let mut updated = buckets.to_vec();
    for deduction in plan {
        // plan_usage only names buckets that exist and never takes more
        // than they hold
        if let Some(bucket) = updated.iter_mut().find(|b| b.category == deduction.category) {
            bucket.remaining_bytes -= deduction.amount_bytes;
        }
    }

    Ok(updated)
}

fn position_of(buckets: &[QuotaBucket], category: Category) -> Result<usize, QuotaError> {
    buckets
        .iter()
        .position(|b| b.category == category)
        .ok_or(QuotaError::MissingBucket(category))
}

// ============================================================================
// Tests
// ============================================================================
