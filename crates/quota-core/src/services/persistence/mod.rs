//! Persistence
//!
//! Asynchronous write-behind of committed snapshots:
//!
//! ```text
//! AccountStore::apply ──enqueue──▶ PersistQueue ──batch──▶ worker task ──save──▶ AccountRepository
//!                                  (bounded,                (retry with           (SQLite)
//!                                   coalescing)              backoff)
//! ```

mod queue;
mod repository;
mod worker;

pub use queue::{Batch, PersistJob, PersistQueue, PushOutcome};
pub use repository::{AccountRepository, SqliteAccountRepository};
pub use worker::{PersistenceHealth, PersistenceWorker};
