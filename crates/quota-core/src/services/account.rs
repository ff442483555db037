//! Account store
//!
//! Owns the canonical account of one user behind a single `RwLock`. Every
//! mutation goes through `apply`, which computes the new bucket set with the
//! ledger while holding the write guard, commits it, releases the guard and
//! only then publishes the snapshot and hands it to the persistence worker.
//! Nothing inside the guard awaits, performs I/O or calls user code.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::feed::{self, FeedStats, UsageEvent};
use super::insight::UsageInsight;
use super::ledger;
use super::notify::{AccountUpdateHandler, NotificationBus, SubscriptionId};
use super::parser::parse_command;
use super::persistence::{
    AccountRepository, PersistenceHealth, PersistenceWorker, SqliteAccountRepository,
};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{Error, ParseError, Result};
use crate::models::{Account, Category, ParsedIntent, Snapshot, UsageRecord};

/// What to do when the repository has no record for the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Start from the configured layout at version 0
    #[default]
    CreateIfMissing,
    /// Fail with `Error::NotFound`
    RequireExisting,
}

/// Single-user account engine
pub struct AccountStore {
    user_id: String,
    state: RwLock<Account>,
    bus: NotificationBus,
    persistence: PersistenceWorker,
    repository: Arc<dyn AccountRepository>,
    config: EngineConfig,
}

impl AccountStore {
    /// Open the account of `user_id` stored in the SQLite file at `persistence_path`
    pub async fn open(user_id: &str, persistence_path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_config(user_id, persistence_path, EngineConfig::default()).await
    }

    /// Open at the default database location (`QUOTA_DB_PATH` or the
    /// platform data directory)
    pub async fn open_default(user_id: &str) -> Result<Arc<Self>> {
        let db = Database::new().await?;
        let repository = Arc::new(SqliteAccountRepository::new(db.pool));
        Self::open_with(
            user_id,
            repository,
            EngineConfig::default(),
            LoadPolicy::CreateIfMissing,
        )
        .await
    }

    /// `open` with an explicit configuration
    pub async fn open_with_config(
        user_id: &str,
        persistence_path: impl AsRef<Path>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let db = Database::open(persistence_path.as_ref().to_path_buf()).await?;
        let repository = Arc::new(SqliteAccountRepository::new(db.pool));
        Self::open_with(user_id, repository, config, LoadPolicy::CreateIfMissing).await
    }

    /// Open against any repository
    ///
    /// Must be called inside a tokio runtime; the worker and subscriber
    /// tasks run on it.
    pub async fn open_with(
        user_id: impl Into<String>,
        repository: Arc<dyn AccountRepository>,
        config: EngineConfig,
        policy: LoadPolicy,
    ) -> Result<Arc<Self>> {
        let user_id = user_id.into();
        let config = config.validate()?;

        let (account, flushed_version) = match repository.load(&user_id).await? {
            Some(snapshot) => {
                let version = snapshot.version;
                log::info!("[account] Loaded {} at version {}", user_id, version);
                (Account::from_snapshot(snapshot)?, Some(version))
            }
            None if policy == LoadPolicy::RequireExisting => {
                return Err(Error::not_found(format!("account {}", user_id)));
            }
            None => {
                log::info!("[account] No stored account for {}, starting fresh", user_id);
                (Account::new(user_id.clone(), config.layout())?, None)
            }
        };

        let bus = NotificationBus::new(account.snapshot(), Handle::current());
        let persistence = PersistenceWorker::start(
            Arc::clone(&repository),
            config.persistence.clone(),
            flushed_version,
        );

        Ok(Arc::new(Self {
            user_id,
            state: RwLock::new(account),
            bus,
            persistence,
            repository,
            config,
        }))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consistent copy of the current state
    pub fn get_snapshot(&self) -> Snapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Apply an intent atomically
    ///
    /// On error the account is untouched and nothing is published or
    /// persisted. Top-ups that would lift the balance past
    /// `MAX_BALANCE_BYTES` fail with `QuotaError::Overflow`.
    pub fn apply(&self, intent: ParsedIntent) -> Result<Snapshot> {
        let (snapshot, usage) = {
            // The account is only replaced after a complete computation, so
            // a poisoned guard still holds a consistent state.
            let mut account = self.state.write().unwrap_or_else(PoisonError::into_inner);

            let buckets = match intent {
                ParsedIntent::TopUp {
                    category,
                    amount_bytes,
                } => ledger::apply_topup(account.buckets(), category, amount_bytes)?,
                ParsedIntent::UsageEvent {
                    category,
                    amount_bytes,
                } => ledger::apply_usage(account.buckets(), category, amount_bytes)?,
            };
            account.commit(buckets)?;

            let snapshot = account.snapshot();
            let usage = match intent {
                ParsedIntent::UsageEvent {
                    category,
                    amount_bytes,
                } => Some(UsageRecord {
                    category,
                    amount_bytes,
                    version: snapshot.version,
                    recorded_at: snapshot.updated_at,
                }),
                ParsedIntent::TopUp { .. } => None,
            };
            (snapshot, usage)
        };

        log::debug!(
            "[account] {} committed version {} (balance {} bytes)",
            self.user_id,
            snapshot.version,
            snapshot.balance_bytes
        );

        self.bus.publish(snapshot.clone());
        self.persistence.enqueue(snapshot.clone(), usage);
        Ok(snapshot)
    }

    /// Parse a free-text purchase command and apply it
    pub fn handle_command(&self, text: &str) -> Result<Snapshot> {
        let intent = parse_command(text)?;
        self.apply(intent)
    }

    /// Record usage against a category alias ("YouTube", "general", ...)
    pub fn simulate_usage(&self, amount_bytes: u64, category: &str) -> Result<Snapshot> {
        let category = Category::from_alias(category)
            .ok_or_else(|| ParseError::UnknownCategory(category.to_string()))?;
        self.record_usage(category, amount_bytes)
    }

    pub fn record_usage(&self, category: Category, amount_bytes: u64) -> Result<Snapshot> {
        self.apply(ParsedIntent::UsageEvent {
            category,
            amount_bytes,
        })
    }

    pub fn top_up(&self, category: Category, amount_bytes: u64) -> Result<Snapshot> {
        self.apply(ParsedIntent::TopUp {
            category,
            amount_bytes,
        })
    }

    /// Register a handler for committed snapshots
    ///
    /// The handler immediately receives the current snapshot.
    pub fn subscribe<H>(&self, handler: H) -> SubscriptionId
    where
        H: AccountUpdateHandler,
    {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn persistence_health(&self) -> PersistenceHealth {
        self.persistence.health()
    }

    /// Wait until `version` or a newer one is stored
    pub async fn wait_for_flush(&self, version: u64, timeout: Duration) -> bool {
        self.persistence.wait_for_flush(version, timeout).await
    }

    /// Stored usage records, newest first
    ///
    /// Reflects what the worker has flushed so far.
    pub async fn usage_history(&self, limit: u32) -> Result<Vec<UsageRecord>> {
        Ok(self.repository.usage_history(&self.user_id, limit).await?)
    }

    /// Forecast from the current balance and the stored usage of the window
    pub async fn insight(&self) -> Result<UsageInsight> {
        let remaining = self.get_snapshot().balance_bytes;
        let window_days = self.config.insight.window_days;
        let since = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(window_days)))
            .ok_or_else(|| Error::config(format!("insight window of {} days", window_days)))?;
        let used = self.repository.usage_since(&self.user_id, since).await?;

        Ok(UsageInsight::compute(
            remaining,
            used,
            window_days,
            self.config.insight.low_balance_days,
        ))
    }

    /// Apply usage events from `receiver` until its senders are dropped
    pub fn spawn_usage_feed(
        self: &Arc<Self>,
        receiver: mpsc::Receiver<UsageEvent>,
    ) -> JoinHandle<FeedStats> {
        feed::spawn_usage_feed(Arc::clone(self), receiver)
    }

    /// Stop persistence after writing everything already committed
    ///
    /// Commits made afterwards stay in memory and are counted as dropped.
    pub async fn shutdown(&self) {
        log::info!("[account] Shutting down {}", self.user_id);
        self.persistence.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
