use crate::db::sqlite::{SqliteDb, SqliteTx};
use crate::db::{downcast_tx, CommitRollbacker};
use crate::types::{AppError, Result};
use crate::users::{Email, Role, User, UserStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row};
use std::sync::Arc;
use uuid::Uuid;

const SELECT_USER: &str = "SELECT id, name, email, roles, password_hash, department, enabled, date_created, date_updated FROM users";

/// [`UserStore`] backed by the local libsql database.
pub struct SqliteUserStore {
    db: Arc<SqliteDb>,
    tx: Option<Arc<SqliteTx>>,
}

impl SqliteUserStore {
    /// Store over `db`.
    pub fn new(db: Arc<SqliteDb>) -> Self {
        Self { db, tx: None }
    }

    fn connection(&self) -> Result<Connection> {
        match &self.tx {
            Some(tx) => Ok(tx.connection().clone()),
            None => self.db.connection(),
        }
    }

    async fn query_one(&self, filter: &str, value: String) -> Result<Option<User>> {
        let conn = self.connection()?;

        let mut rows = conn
            .query(&format!("{} WHERE {} = ?", SELECT_USER, filter), [value])
            .await
            .map_err(|e| AppError::Internal(format!("Failed to query user: {}", e)))?;

        match rows
            .next()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }
}

fn db_err(e: libsql::Error) -> AppError {
    AppError::Internal(e.to_string())
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::Internal(format!("invalid timestamp {}", secs)))
}

fn row_to_user(row: &Row) -> Result<User> {
    let id: String = row.get(0).map_err(db_err)?;
    let email: String = row.get(2).map_err(db_err)?;
    let roles: String = row.get(3).map_err(db_err)?;
    let department: String = row.get(5).map_err(db_err)?;
    let enabled: i64 = row.get(6).map_err(db_err)?;

    Ok(User {
        id: Uuid::parse_str(&id).map_err(|e| AppError::Internal(format!("stored id: {}", e)))?,
        name: row.get(1).map_err(db_err)?,
        email: Email::parse(&email)?,
        roles: roles
            .split(',')
            .filter(|r| !r.is_empty())
            .map(str::parse::<Role>)
            .collect::<Result<Vec<_>>>()?,
        password_hash: row.get(4).map_err(db_err)?,
        department: (!department.is_empty()).then_some(department),
        enabled: enabled != 0,
        date_created: timestamp(row.get(7).map_err(db_err)?)?,
        date_updated: timestamp(row.get(8).map_err(db_err)?)?,
    })
}

#[async_trait]
impl UserStore for SqliteUserStore {
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn UserStore>> {
        let tx = downcast_tx::<SqliteTx>(tx).ok_or_else(|| {
            AppError::Internal("transaction does not belong to the sqlite store".to_string())
        })?;

        Ok(Arc::new(SqliteUserStore {
            db: self.db.clone(),
            tx: Some(tx),
        }))
    }

    async fn create(&self, user: &User) -> Result<()> {
        let conn = self.connection()?;
        let roles = Role::to_strings(&user.roles).join(",");

        conn.execute(
            "INSERT INTO users (id, name, email, roles, password_hash, department, enabled, date_created, date_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                user.id.to_string(),
                user.name.clone(),
                user.email.to_string(),
                roles,
                user.password_hash.clone(),
                user.department.clone().unwrap_or_default(),
                i64::from(user.enabled),
                user.date_created.timestamp(),
                user.date_updated.timestamp(),
            ],
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE constraint failed") {
                AppError::Aborted(format!("email is not unique: {}", user.email))
            } else {
                AppError::Internal(format!("Failed to create user: {}", msg))
            }
        })?;

        Ok(())
    }

    async fn delete(&self, user: &User) -> Result<()> {
        let conn = self.connection()?;

        conn.execute("DELETE FROM users WHERE id = ?", [user.id.to_string()])
            .await
            .map_err(|e| AppError::Internal(format!("Failed to delete user: {}", e)))?;

        Ok(())
    }

    async fn query_by_id(&self, user_id: Uuid) -> Result<User> {
        self.query_one("id", user_id.to_string())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user not found: {}", user_id)))
    }

    async fn query_by_email(&self, email: &Email) -> Result<User> {
        self.query_one("email", email.to_string())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user not found: {}", email)))
    }
}
