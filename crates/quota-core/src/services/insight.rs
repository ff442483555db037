//! Balance forecast
//!
//! Averages the usage of a trailing window and estimates how long the
//! remaining balance lasts at that rate.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::parser::BYTES_PER_GB;

/// Usage summary and top-up recommendation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInsight {
    pub remaining_bytes: u64,
    pub used_in_window_bytes: u64,
    pub daily_average_bytes: u64,
    /// Whole days the balance lasts at the average rate, `None` without usage
    pub days_left: Option<u64>,
    pub window_days: u32,
    pub recommend_top_up: bool,
}

impl UsageInsight {
    pub fn compute(
        remaining_bytes: u64,
        used_in_window_bytes: u64,
        window_days: u32,
        low_balance_days: u64,
    ) -> Self {
        let window_days = window_days.max(1);
        let daily_average_bytes = used_in_window_bytes / u64::from(window_days);
        let days_left = (daily_average_bytes > 0).then(|| remaining_bytes / daily_average_bytes);

        let recommend_top_up = remaining_bytes == 0
            || days_left.is_some_and(|days| days < low_balance_days);

        Self {
            remaining_bytes,
            used_in_window_bytes,
            daily_average_bytes,
            days_left,
            window_days,
            recommend_top_up,
        }
    }
}

fn as_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB as f64
}

impl fmt::Display for UsageInsight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} GB remaining. ", as_gb(self.remaining_bytes))?;

        match self.days_left {
            Some(days) => write!(
                f,
                "Average use is {:.2} GB/day over the last {} days, enough for about {} more day{}.",
                as_gb(self.daily_average_bytes),
                self.window_days,
                days,
                if days == 1 { "" } else { "s" }
            )?,
            None => write!(f, "No usage in the last {} days.", self.window_days)?,
        }

        if self.recommend_top_up {
            f.write_str(" Consider topping up soon.")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = BYTES_PER_GB;

    #[test]
    fn test_plenty_left() {
        let insight = UsageInsight::compute(10 * GB, 7 * GB, 7, 3);
        assert_eq!(insight.daily_average_bytes, GB);
        assert_eq!(insight.days_left, Some(10));
        assert!(!insight.recommend_top_up);
    }

    #[test]
    fn test_low_balance_recommends_top_up() {
        let insight = UsageInsight::compute(2 * GB, 7 * GB, 7, 3);
        assert_eq!(insight.days_left, Some(2));
        assert!(insight.recommend_top_up);
        assert!(insight.to_string().ends_with("Consider topping up soon."));
    }

    #[test]
    fn test_no_usage() {
        let insight = UsageInsight::compute(GB, 0, 7, 3);
        assert_eq!(insight.days_left, None);
        assert!(!insight.recommend_top_up);
        assert_eq!(
            insight.to_string(),
            "1.00 GB remaining. No usage in the last 7 days."
        );
    }

    #[test]
    fn test_empty_balance_recommends_top_up() {
        let insight = UsageInsight::compute(0, 0, 7, 3);
        assert!(insight.recommend_top_up);
    }

    #[test]
    fn test_zero_window_is_clamped() {
        let insight = UsageInsight::compute(4 * GB, 2 * GB, 0, 3);
        assert_eq!(insight.window_days, 1);
        assert_eq!(insight.days_left, Some(2));
    }

    #[test]
    fn test_display_sentence() {
        let insight = UsageInsight::compute(5 * GB, 7 * GB, 7, 3);
        assert_eq!(
            insight.to_string(),
            "5.00 GB remaining. Average use is 1.00 GB/day over the last 7 days, enough for about 5 more days."
        );
    }
}
