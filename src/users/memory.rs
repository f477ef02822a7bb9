//! In-memory identity storage with real transaction semantics.
//!
//! Writes made through a transaction are staged and only become visible to
//! other callers on commit. Used by the `minimal` build and by tests, which
//! also read its access counters.

use crate::db::{downcast_tx, Beginner, CommitRollbacker};
use crate::types::{AppError, Result};
use crate::users::{Email, User, UserStore};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type Table = HashMap<Uuid, User>;

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Shared in-memory database.
#[derive(Clone, Default)]
pub struct MemoryDb {
    users: Arc<RwLock<Table>>,
    counters: Arc<Counters>,
}

impl MemoryDb {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store operating outside any transaction.
    pub fn store(&self) -> Arc<dyn UserStore> {
        Arc::new(MemoryUserStore {
            db: self.clone(),
            tx: None,
        })
    }

    /// Number of committed users.
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// True when no user is committed.
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Number of query calls served so far.
    pub fn reads(&self) -> u64 {
        self.counters.reads.load(Ordering::SeqCst)
    }

    /// Number of committed transactions.
    pub fn commits(&self) -> u64 {
        self.counters.commits.load(Ordering::SeqCst)
    }

    /// Rollbacks, explicit or by dropping an open transaction.
    pub fn rollbacks(&self) -> u64 {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Beginner for MemoryDb {
    async fn begin(&self) -> Result<Arc<dyn CommitRollbacker>> {
        Ok(Arc::new(MemoryTx {
            db: self.clone(),
            staged: Mutex::new(Vec::new()),
            finished: Mutex::new(false),
        }))
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(User),
    Remove(Uuid),
}

fn apply(table: &mut Table, op: &Op) -> Result<()> {
    match op {
        Op::Insert(user) => {
            if table.values().any(|u| u.email == user.email && u.id != user.id) {
                return Err(AppError::Aborted(format!(
                    "email is not unique: {}",
                    user.email
                )));
            }
            table.insert(user.id, user.clone());
        }
        Op::Remove(id) => {
            table.remove(id);
        }
    }
    Ok(())
}

/// A transaction over [`MemoryDb`].
pub struct MemoryTx {
    db: MemoryDb,
    staged: Mutex<Vec<Op>>,
    finished: Mutex<bool>,
}

impl MemoryTx {
    fn finish(&self) -> Result<()> {
        let mut finished = self.finished.lock();
        if *finished {
            return Err(AppError::Internal("transaction already finished".to_string()));
        }
        *finished = true;
        Ok(())
    }

    /// Committed rows with this transaction's staged writes applied.
    fn view(&self) -> Table {
        let mut table = self.db.users.read().clone();
        for op in self.staged.lock().iter() {
            // Staged ops were checked when staged; a conflict here means a
            // concurrent commit, which surfaces at our own commit.
            let _ = apply(&mut table, op);
        }
        table
    }

    fn stage(&self, op: Op) -> Result<()> {
        let mut view = self.view();
        apply(&mut view, &op)?;
        self.staged.lock().push(op);
        Ok(())
    }
}

#[async_trait]
impl CommitRollbacker for MemoryTx {
    async fn commit(&self) -> Result<()> {
        self.finish()?;

        let ops = std::mem::take(&mut *self.staged.lock());
        let mut users = self.db.users.write();
        let mut next = users.clone();
        for op in &ops {
            apply(&mut next, op)?;
        }
        *users = next;

        self.db.counters.commits.fetch_add(1, Ordering::SeqCst);
        debug!(ops = ops.len(), "memory transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finish()?;
        self.staged.lock().clear();
        self.db.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        debug!("memory transaction rolled back");
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !*self.finished.get_mut() {
            self.db.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            debug!("memory transaction dropped while open, rolled back");
        }
    }
}

/// [`UserStore`] over [`MemoryDb`], optionally bound to a transaction.
pub struct MemoryUserStore {
    db: MemoryDb,
    tx: Option<Arc<MemoryTx>>,
}

impl MemoryUserStore {
    fn find(&self, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.db.counters.reads.fetch_add(1, Ordering::SeqCst);
        match &self.tx {
            Some(tx) => tx.view().into_values().find(|u| pred(u)),
            None => self.db.users.read().values().find(|u| pred(u)).cloned(),
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn UserStore>> {
        let tx = downcast_tx::<MemoryTx>(tx).ok_or_else(|| {
            AppError::Internal("transaction does not belong to the memory store".to_string())
        })?;

        Ok(Arc::new(MemoryUserStore {
            db: self.db.clone(),
            tx: Some(tx),
        }))
    }

    async fn create(&self, user: &User) -> Result<()> {
        let op = Op::Insert(user.clone());
        match &self.tx {
            Some(tx) => tx.stage(op),
            None => {
                let mut users = self.db.users.write();
                if users.contains_key(&user.id) {
                    return Err(AppError::Aborted(format!("user {} exists", user.id)));
                }
                apply(&mut users, &op)
            }
        }
    }

    async fn delete(&self, user: &User) -> Result<()> {
        let op = Op::Remove(user.id);
        match &self.tx {
            Some(tx) => tx.stage(op),
            None => apply(&mut self.db.users.write(), &op),
        }
    }

    async fn query_by_id(&self, user_id: Uuid) -> Result<User> {
        self.find(|u| u.id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("user not found: {}", user_id)))
    }

    async fn query_by_email(&self, email: &Email) -> Result<User> {
        self.find(|u| &u.email == email)
            .ok_or_else(|| AppError::NotFound(format!("user not found: {}", email)))
    }
}
