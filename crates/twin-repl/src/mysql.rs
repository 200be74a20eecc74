//! `Database` backed by a single MySQL connection.
//!
//! `FLUSH TABLES WITH READ LOCK` only holds while the session that issued it
//! stays open, so the connection is parked between acquire and release.
//! Dropping it ends the server session and with it the lock.

use crate::config::DatabaseConfig;
use crate::error::{Result, TwinError};
use crate::guard::Database;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection, Executor};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const LOCK_STATEMENT: &str = "FLUSH TABLES WITH READ LOCK";
const UNLOCK_STATEMENT: &str = "UNLOCK TABLES";

/// MySQL server reached over the wire protocol.
pub struct MysqlDatabase {
    config: DatabaseConfig,
    connection: Mutex<Option<MySqlConnection>>,
}

impl MysqlDatabase {
    /// Create a client for the configured server. No connection is made yet.
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    fn options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user);
        match self.config.password {
            Some(ref password) => options.password(password),
            None => options,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.statement_timeout_secs)
    }

    /// Run `step` under the statement timeout. Dropping the future on expiry
    /// drops whatever connection it holds.
    async fn bounded<T, F>(&self, what: &str, step: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout(), step).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TwinError::Database {
                msg: format!("{}: {}", what, e),
            }),
            Err(_) => Err(TwinError::Database {
                msg: format!("{}: no response within {}s", what, self.timeout().as_secs()),
            }),
        }
    }
}

#[async_trait]
impl Database for MysqlDatabase {
    async fn acquire_read_lock(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            return Err(TwinError::Database {
                msg: "read lock already held".to_string(),
            });
        }

        debug!(host = %self.config.host, user = %self.config.user, "Opening database session");
        let options = self.options();
        let mut connection = self.bounded("connect", options.connect()).await?;
        self.bounded(LOCK_STATEMENT, connection.execute(LOCK_STATEMENT))
            .await?;

        *slot = Some(connection);
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            debug!("No database session to unlock");
            return Ok(());
        };

        let result = self
            .bounded(UNLOCK_STATEMENT, connection.execute(UNLOCK_STATEMENT))
            .await
            .map(|_| ());
        // closing the session drops the lock even if UNLOCK failed
        if let Err(e) = self.bounded("close", connection.close()).await {
            debug!(error = %e, "Database session closed uncleanly");
        }
        result
    }
}
