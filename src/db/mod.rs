//! Transaction seam between the request pipeline and the storage backends.
//!
//! The pipeline only knows how to begin, commit and roll back. Stores that
//! take part in a request's transaction recover their concrete transaction
//! type from the shared handle through [`CommitRollbacker::into_any`].

/// libsql-backed transactions.
#[cfg(feature = "local-db")]
pub mod sqlite;

use crate::types::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

#[cfg(feature = "local-db")]
pub use sqlite::SqliteDb;

/// Something that can open a transaction.
#[async_trait]
pub trait Beginner: Send + Sync {
    /// Opens a transaction.
    async fn begin(&self) -> Result<Arc<dyn CommitRollbacker>>;

    /// Cheap liveness probe used by readiness checks.
    async fn status_check(&self) -> Result<()> {
        Ok(())
    }
}

/// An open transaction.
///
/// Implementations must tolerate `commit`/`rollback` being called at most
/// once each, and must roll back when dropped without either.
#[async_trait]
pub trait CommitRollbacker: Send + Sync {
    /// Makes the transaction's writes durable.
    async fn commit(&self) -> Result<()>;

    /// Discards the transaction's writes.
    async fn rollback(&self) -> Result<()>;

    /// Type-erased handle for [`downcast_tx`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recovers the concrete transaction type behind a shared handle.
pub fn downcast_tx<T: Any + Send + Sync>(tx: &Arc<dyn CommitRollbacker>) -> Option<Arc<T>> {
    tx.clone().into_any().downcast::<T>().ok()
}
