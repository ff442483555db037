//! # quota-core
//!
//! In-process account engine for categorized data quotas.
//!
//! This crate provides:
//! - Command parsing (`services::parser`)
//! - Cascading bucket arithmetic (`services::ledger`)
//! - The guarded account store (`services::account`)
//! - Change notification (`services::notify`)
//! - Background persistence to SQLite (`services::persistence`, `db` module)
//! - Configuration (`config` module)
//! - Unified error handling (`error` module)

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

// Re-exports for convenience
pub use config::EngineConfig;
pub use db::Database;
pub use error::{Error, ParseError, PersistenceError, QuotaError, Result};

pub use models::{Account, Category, ParsedIntent, QuotaBucket, Snapshot, UsageRecord};

pub use services::{
    parse_command, AccountRepository, AccountStore, AccountUpdateHandler, FeedStats, LoadPolicy,
    PersistenceHealth, SqliteAccountRepository, SubscriptionId, TrafficCounter, UsageEvent,
    UsageInsight,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
