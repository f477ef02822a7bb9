use crate::db::{Beginner, CommitRollbacker};
use crate::types::{AppError, Result};
use async_trait::async_trait;
use libsql::{Builder, Connection, Database};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, warn};

/// Local libsql database holding the identity tables.
pub struct SqliteDb {
    db: Database,
}

impl SqliteDb {
    /// Opens (creating if needed) the database file at `path` and applies the
    /// schema.
    pub async fn new_local(path: &str) -> Result<Self> {
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to open database {}: {}", path, e)))?;

        let client = Self { db };
        client.initialize_schema().await?;

        Ok(client)
    }

    /// Opens a new connection to the database.
    pub fn connection(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| AppError::Internal(format!("Failed to get connection: {}", e)))
    }

    async fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                roles TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                department TEXT,
                enabled INTEGER NOT NULL,
                date_created INTEGER NOT NULL,
                date_updated INTEGER NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| AppError::Internal(format!("Failed to create users table: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl Beginner for SqliteDb {
    async fn begin(&self) -> Result<Arc<dyn CommitRollbacker>> {
        let conn = self.connection()?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| AppError::Internal(format!("Failed to begin transaction: {}", e)))?;

        Ok(Arc::new(SqliteTx {
            conn,
            finished: Mutex::new(false),
        }))
    }

    async fn status_check(&self) -> Result<()> {
        let conn = self.connection()?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| AppError::Internal(format!("status check: {}", e)))?;
        rows.next()
            .await
            .map_err(|e| AppError::Internal(format!("status check: {}", e)))?;
        Ok(())
    }
}

/// A transaction pinned to one connection.
///
/// Dropping the last handle closes the connection, which discards anything
/// not committed.
pub struct SqliteTx {
    conn: Connection,
    finished: Mutex<bool>,
}

impl SqliteTx {
    /// The connection statements inside this transaction must run on.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn finish(&self) -> Result<()> {
        let mut finished = self.finished.lock();
        if *finished {
            return Err(AppError::Internal("transaction already finished".to_string()));
        }
        *finished = true;
        Ok(())
    }
}

#[async_trait]
impl CommitRollbacker for SqliteTx {
    async fn commit(&self) -> Result<()> {
        self.finish()?;
        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| AppError::Internal(format!("Failed to commit: {}", e)))?;
        debug!("transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finish()?;
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| AppError::Internal(format!("Failed to roll back: {}", e)))?;
        debug!("transaction rolled back");
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if !*self.finished.get_mut() {
            warn!("transaction dropped while open, rolling back");
        }
    }
}
