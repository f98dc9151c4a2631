use std::sync::Arc;

use async_trait::async_trait;

use crate::config::HistoryStore;
use crate::error::Result;
use crate::schema::SchemaModel;

use super::local::LocalMigrationStore;
use super::postgres::PostgresMigrationStore;
use super::script::RevisionScript;

/// Holds the store-scoped migration lock until released or dropped.
#[async_trait]
pub trait LockGuard: Send {
    /// Who holds the lock, for logs.
    fn holder(&self) -> String;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// Persisted migration history plus the live schema it governs.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Try once to take the migration lock. `Ok(None)` means another holder has it.
    async fn try_lock(&self) -> Result<Option<Box<dyn LockGuard>>>;

    /// Versions recorded as applied, oldest first.
    async fn applied(&self) -> Result<Vec<String>>;

    /// Apply one script and record it, atomically.
    async fn apply(&self, script: &RevisionScript) -> Result<()>;

    async fn live_schema(&self) -> Result<SchemaModel>;

    /// Describe whoever currently holds the lock, when known.
    async fn lock_holder(&self) -> Option<String> {
        None
    }

    fn describe(&self) -> String;
}

/// Open the store a service's history descriptor points at.
pub fn open_store(history: &HistoryStore) -> Result<Arc<dyn MigrationStore>> {
    let store: Arc<dyn MigrationStore> = match history {
        HistoryStore::Local { path } => Arc::new(LocalMigrationStore::new(path)),
        HistoryStore::Postgres {
            url,
            schema,
            table,
            lock_key,
        } => Arc::new(PostgresMigrationStore::new(
            url,
            schema,
            table,
            *lock_key,
        )),
    };
    Ok(store)
}
