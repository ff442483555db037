//! Services module

pub mod account;
pub mod feed;
pub mod insight;
pub mod ledger;
pub mod notify;
pub mod parser;
pub mod persistence;

pub use account::{AccountStore, LoadPolicy};
pub use feed::{spawn_usage_feed, FeedStats, TrafficCounter, UsageEvent};
pub use insight::UsageInsight;
pub use ledger::{apply_topup, apply_usage, plan_usage, Deduction, MAX_BALANCE_BYTES};
pub use notify::{AccountUpdateHandler, NotificationBus, SubscriptionId};
pub use parser::{parse_command, BYTES_PER_GB, BYTES_PER_MB};
pub use persistence::{
    AccountRepository, PersistenceHealth, PersistenceWorker, SqliteAccountRepository,
};
