//! Identity business layer.
//!
//! [`UserBus`] owns the rules (password hashing, notifying other domains
//! after a delete) and talks to storage through [`UserStore`]. Cross-cutting
//! behavior is layered on with [`Extension`]s over [`ExtBusiness`], and the
//! read path can be shielded by [`cache::CachedUserStore`].

/// Identity cache in front of a store.
pub mod cache;
/// In-memory store.
pub mod memory;
/// libsql store.
#[cfg(feature = "local-db")]
pub mod sqlite;
/// Tracing extension.
pub mod trace;

use crate::db::CommitRollbacker;
use crate::delegate::{Data, Delegate};
use crate::types::{AppError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Domain name used when announcing user events.
pub const DOMAIN: &str = "user";
/// Action announced after a user is deleted.
pub const ACTION_DELETED: &str = "deleted";

// ============= Domain Types =============

/// A role granted to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Full access.
    #[serde(rename = "ADMIN")]
    Admin,
    /// Access to one's own identity.
    #[serde(rename = "USER")]
    User,
}

impl Role {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::User => "USER",
        }
    }

    /// Role names as carried in token claims.
    pub fn to_strings(roles: &[Role]) -> Vec<String> {
        roles.iter().map(|r| r.as_str().to_string()).collect()
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADMIN" => Ok(Role::Admin),
            "USER" => Ok(Role::User),
            other => Err(AppError::InvalidArgument(format!("invalid role {:?}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A syntactically checked email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    /// Lowercases and validates an address.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let valid = match address.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !address.chars().any(char::is_whitespace)
            }
            None => false,
        };

        if !valid {
            return Err(AppError::InvalidArgument(format!(
                "invalid email address {:?}",
                address
            )));
        }

        Ok(Self(address.to_string()))
    }

    /// The normalized address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Email::parse(&value)
    }
}

impl From<Email> for String {
    fn from(email: Email) -> Self {
        email.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Unique id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Unique email address.
    pub email: Email,
    /// Granted roles.
    pub roles: Vec<Role>,
    /// Argon2 PHC hash.
    pub password_hash: String,
    /// Optional department.
    pub department: Option<String>,
    /// Disabled users cannot sign in.
    pub enabled: bool,
    /// Creation time.
    pub date_created: DateTime<Utc>,
    /// Last update time.
    pub date_updated: DateTime<Utc>,
}

impl User {
    /// True when `role` is granted.
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Data required to create a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: Email,
    /// Roles to grant.
    pub roles: Vec<Role>,
    /// Optional department.
    pub department: Option<String>,
    /// Plain-text password, hashed before storage.
    pub password: String,
}

// ============= Seams =============

/// Storage behavior the business layer needs.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Returns a store whose calls run inside `tx`.
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn UserStore>>;

    /// Inserts `user`; a duplicate email is `Aborted`.
    async fn create(&self, user: &User) -> Result<()>;

    /// Removes `user`; a missing user is `NotFound`.
    async fn delete(&self, user: &User) -> Result<()>;

    /// `NotFound` when no user has the id.
    async fn query_by_id(&self, user_id: Uuid) -> Result<User>;

    /// `NotFound` when no user has the address.
    async fn query_by_email(&self, email: &Email) -> Result<User>;
}

/// The business API that extensions wrap.
#[async_trait]
pub trait ExtBusiness: Send + Sync {
    /// Returns a business value whose store calls run inside `tx`.
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn ExtBusiness>>;

    /// Validates `nu`, hashes its password and stores the new user.
    async fn create(&self, actor_id: Uuid, nu: NewUser) -> Result<User>;

    /// Deletes `user` and announces the deletion.
    async fn delete(&self, actor_id: Uuid, user: &User) -> Result<()>;

    /// Looks a user up by id.
    async fn query_by_id(&self, user_id: Uuid) -> Result<User>;

    /// Looks a user up by email.
    async fn query_by_email(&self, email: &Email) -> Result<User>;

    /// Finds the user by email and checks the password against its hash.
    async fn authenticate(&self, email: &Email, password: &str) -> Result<User>;
}

/// Wraps one more layer of behavior around a business value.
pub type Extension = Arc<dyn Fn(Arc<dyn ExtBusiness>) -> Arc<dyn ExtBusiness> + Send + Sync>;

/// Builds the business layer, applying `extensions` so that the first one
/// is outermost.
pub fn new_business(
    delegate: Arc<Delegate>,
    store: Arc<dyn UserStore>,
    extensions: Vec<Extension>,
) -> Arc<dyn ExtBusiness> {
    let core: Arc<dyn ExtBusiness> = Arc::new(UserBus { delegate, store });
    extensions.iter().rev().fold(core, |bus, ext| ext(bus))
}

// ============= Core Business =============

/// Core user business rules.
pub struct UserBus {
    delegate: Arc<Delegate>,
    store: Arc<dyn UserStore>,
}

impl UserBus {
    /// Business layer over `store`, announcing through `delegate`.
    pub fn new(delegate: Arc<Delegate>, store: Arc<dyn UserStore>) -> Self {
        Self { delegate, store }
    }
}

#[async_trait]
impl ExtBusiness for UserBus {
    fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn ExtBusiness>> {
        Ok(Arc::new(UserBus {
            delegate: self.delegate.clone(),
            store: self.store.with_tx(tx)?,
        }))
    }

    async fn create(&self, _actor_id: Uuid, nu: NewUser) -> Result<User> {
        if nu.name.trim().is_empty() {
            return Err(AppError::InvalidArgument("name is required".to_string()));
        }
        if nu.password.is_empty() {
            return Err(AppError::InvalidArgument("password is required".to_string()));
        }
        if nu.roles.is_empty() {
            return Err(AppError::InvalidArgument("at least one role is required".to_string()));
        }

        let password_hash = hash_password(&nu.password)?;
        let now = Utc::now().trunc_subsecs(0);

        let user = User {
            id: Uuid::new_v4(),
            name: nu.name,
            email: nu.email,
            roles: nu.roles,
            password_hash,
            department: nu.department,
            enabled: true,
            date_created: now,
            date_updated: now,
        };

        self.store.create(&user).await?;

        Ok(user)
    }

    async fn delete(&self, _actor_id: Uuid, user: &User) -> Result<()> {
        self.store.delete(user).await?;

        // Other domains react to a deleted user; their failure fails the delete.
        self.delegate
            .call(action_deleted_data(user.id))
            .await
            .map_err(|e| {
                AppError::Internal(format!("failed to execute `{}` action: {}", ACTION_DELETED, e))
            })
    }

    async fn query_by_id(&self, user_id: Uuid) -> Result<User> {
        self.store.query_by_id(user_id).await
    }

    async fn query_by_email(&self, email: &Email) -> Result<User> {
        self.store.query_by_email(email).await
    }

    async fn authenticate(&self, email: &Email, password: &str) -> Result<User> {
        let user = self.store.query_by_email(email).await.map_err(|e| match e {
            AppError::NotFound(_) => AppError::Unauthenticated("authentication failed".to_string()),
            other => other,
        })?;

        if !user.enabled {
            return Err(AppError::Unauthenticated("user is disabled".to_string()));
        }

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthenticated("authentication failed".to_string()));
        }

        Ok(user)
    }
}

/// Event payload announcing that `user_id` was deleted.
pub fn action_deleted_data(user_id: Uuid) -> Data {
    Data {
        domain: DOMAIN.to_string(),
        action: ACTION_DELETED.to_string(),
        params: serde_json::json!({ "userID": user_id }),
    }
}

/// Hashes a password using Argon2id into a PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verifies a password against an Argon2 PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::memory::MemoryDb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Bill Kennedy".to_string(),
            email: Email::parse(email).unwrap(),
            roles: vec![Role::User],
            department: Some("sales".to_string()),
            password: "gophers".to_string(),
        }
    }

    #[test]
    fn test_email_parse() {
        assert!(Email::parse("user@example.com").is_ok());
        assert_eq!(Email::parse("  user@example.com ").unwrap().as_str(), "user@example.com");

        for bad in ["", "user", "@example.com", "user@", "a@b@c", "us er@example.com", "user@.com"] {
            assert!(Email::parse(bad).is_err(), "should reject {:?}", bad);
        }
    }

    #[test]
    fn test_role_round_trip() {
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::User.to_string(), "USER");
        assert!("root".parse::<Role>().is_err());
        assert_eq!(
            Role::to_strings(&[Role::Admin, Role::User]),
            vec!["ADMIN".to_string(), "USER".to_string()]
        );
    }

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("test_password_123").expect("should hash password");

        assert_ne!(hash, "test_password_123");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("test_password_123", &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let db = MemoryDb::new();
        let bus = new_business(Arc::new(Delegate::new()), db.store(), vec![]);

        let user = bus.create(Uuid::nil(), new_user("bill@example.com")).await.unwrap();
        assert!(user.enabled);
        assert_ne!(user.password_hash, "gophers");

        let found = bus
            .authenticate(&Email::parse("bill@example.com").unwrap(), "gophers")
            .await
            .unwrap();
        assert_eq!(found.id, user.id);

        let wrong = bus
            .authenticate(&Email::parse("bill@example.com").unwrap(), "cats")
            .await;
        assert!(matches!(wrong, Err(AppError::Unauthenticated(_))));

        let missing = bus
            .authenticate(&Email::parse("nobody@example.com").unwrap(), "gophers")
            .await;
        assert!(matches!(missing, Err(AppError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn test_duplicate_email_is_aborted() {
        let db = MemoryDb::new();
        let bus = new_business(Arc::new(Delegate::new()), db.store(), vec![]);

        bus.create(Uuid::nil(), new_user("dup@example.com")).await.unwrap();
        let again = bus.create(Uuid::nil(), new_user("dup@example.com")).await;

        assert!(matches!(again, Err(AppError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let db = MemoryDb::new();
        let bus = new_business(Arc::new(Delegate::new()), db.store(), vec![]);

        let mut nu = new_user("v@example.com");
        nu.roles.clear();
        assert!(matches!(
            bus.create(Uuid::nil(), nu).await,
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_notifies_other_domains() {
        let db = MemoryDb::new();
        let delegate = Arc::new(Delegate::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        delegate.register(DOMAIN, ACTION_DELETED, move |data: Data| {
            let counter = counter.clone();
            async move {
                assert!(data.params.get("userID").is_some());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let bus = new_business(delegate, db.store(), vec![]);
        let user = bus.create(Uuid::nil(), new_user("gone@example.com")).await.unwrap();
        bus.delete(Uuid::nil(), &user).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(
            bus.query_by_id(user.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_fails_when_subscriber_fails() {
        let db = MemoryDb::new();
        let delegate = Arc::new(Delegate::new());
        delegate.register(DOMAIN, ACTION_DELETED, |_data: Data| async {
            Err(AppError::FailedPrecondition("user still owns products".to_string()))
        });

        let bus = new_business(delegate, db.store(), vec![]);
        let user = bus.create(Uuid::nil(), new_user("owner@example.com")).await.unwrap();

        assert!(bus.delete(Uuid::nil(), &user).await.is_err());
    }

    #[tokio::test]
    async fn test_extensions_first_is_outermost() {
        use parking_lot::Mutex;

        struct Recorder {
            name: &'static str,
            log: Arc<Mutex<Vec<&'static str>>>,
            inner: Arc<dyn ExtBusiness>,
        }

        #[async_trait]
        impl ExtBusiness for Recorder {
            fn with_tx(&self, tx: &Arc<dyn CommitRollbacker>) -> Result<Arc<dyn ExtBusiness>> {
                self.inner.with_tx(tx)
            }
            async fn create(&self, actor_id: Uuid, nu: NewUser) -> Result<User> {
                self.log.lock().push(self.name);
                self.inner.create(actor_id, nu).await
            }
            async fn delete(&self, actor_id: Uuid, user: &User) -> Result<()> {
                self.inner.delete(actor_id, user).await
            }
            async fn query_by_id(&self, user_id: Uuid) -> Result<User> {
                self.inner.query_by_id(user_id).await
            }
            async fn query_by_email(&self, email: &Email) -> Result<User> {
                self.inner.query_by_email(email).await
            }
            async fn authenticate(&self, email: &Email, password: &str) -> Result<User> {
                self.inner.authenticate(email, password).await
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let ext = |name: &'static str| -> Extension {
            let log = log.clone();
            Arc::new(move |inner| {
                Arc::new(Recorder {
                    name,
                    log: log.clone(),
                    inner,
                })
            })
        };

        let db = MemoryDb::new();
        let bus = new_business(Arc::new(Delegate::new()), db.store(), vec![ext("outer"), ext("inner")]);
        bus.create(Uuid::nil(), new_user("ext@example.com")).await.unwrap();

        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }
}
