//! Database quiescing around a snapshot.

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Relational database that can be read-locked server-wide.
#[async_trait]
pub trait Database: Send + Sync {
    /// Take a read lock across all tables.
    async fn acquire_read_lock(&self) -> Result<()>;

    /// Release the lock taken by `acquire_read_lock`.
    async fn release_lock(&self) -> Result<()>;
}

/// A `Database` for domains with nothing to quiesce.
pub struct NoDatabase;

#[async_trait]
impl Database for NoDatabase {
    async fn acquire_read_lock(&self) -> Result<()> {
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        Ok(())
    }
}

/// Brackets an action with a database-wide read lock.
///
/// Lock failures are logged and tolerated: losing the consistency guarantee
/// for one cycle is preferred over losing the cycle.
pub struct ConsistencyGuard {
    database: Arc<dyn Database>,
}

impl ConsistencyGuard {
    /// Create a guard over the given database.
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }

    /// Run `action` while the database is read-locked.
    ///
    /// The lock is released exactly once after `action` finishes, whether it
    /// succeeded or not, and `action`'s result is returned unchanged.
    pub async fn with_database_lock<F, Fut, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        info!("Locking database");
        if let Err(e) = self.database.acquire_read_lock().await {
            warn!(error = %e, "Failed to lock database, snapshot may be inconsistent");
        }

        let result = action().await;

        info!("Unlocking database");
        if let Err(e) = self.database.release_lock().await {
            warn!(error = %e, "Failed to unlock database");
        }

        result
    }
}
