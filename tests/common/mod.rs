//! Shared fixtures for integration tests.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine};
use gatehouse::api::routes::{self, AuthConfig, SalesConfig};
use gatehouse::auth::jwt::AuthService;
use gatehouse::auth::keystore::{KeyRecord, KeyStore};
use gatehouse::auth::middleware::Authenticator;
use gatehouse::delegate::Delegate;
use gatehouse::metrics::Metrics;
use gatehouse::users::memory::MemoryDb;
use gatehouse::users::{self, Email, ExtBusiness, NewUser, Role, User};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

pub const KID: &str = "54bb2165-71e1-41a6-af3e-7da4a0e1e2c1";
pub const OTHER_KID: &str = "8b3f1c2e-4a7d-4e1b-9c2f-0d6e5a4b3c21";
pub const ISSUER: &str = "service project";

pub const PEM: &str = include_str!("../fixtures/keys/54bb2165-71e1-41a6-af3e-7da4a0e1e2c1.pem");
pub const OTHER_PEM: &str = include_str!("../fixtures/keys/8b3f1c2e-4a7d-4e1b-9c2f-0d6e5a4b3c21.pem");
pub const ROGUE_PEM: &str = include_str!("../fixtures/rogue.pem");

pub fn key_store() -> KeyStore {
    let mut keys = KeyStore::new();
    keys.insert(KeyRecord::from_pem(KID, PEM).unwrap());
    keys.insert(KeyRecord::from_pem(OTHER_KID, OTHER_PEM).unwrap());
    keys
}

pub fn auth_service() -> Arc<AuthService> {
    Arc::new(AuthService::new(Arc::new(key_store()), ISSUER).unwrap())
}

/// A token engine holding a different private key under [`KID`].
pub fn rogue_service() -> AuthService {
    let mut keys = KeyStore::new();
    keys.insert(KeyRecord::from_pem(KID, ROGUE_PEM).unwrap());
    AuthService::new(Arc::new(keys), ISSUER).unwrap()
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

pub fn basic(email: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", email, password)))
}

/// Everything both services share in a test: one database and one engine.
pub struct Harness {
    pub db: MemoryDb,
    pub auth: Arc<AuthService>,
    pub users: Arc<dyn ExtBusiness>,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        let db = MemoryDb::new();
        Self {
            users: users::new_business(Arc::new(Delegate::new()), db.store(), vec![]),
            auth: auth_service(),
            metrics: Arc::new(Metrics::new()),
            db,
        }
    }

    pub async fn seed(&self, email: &str, password: &str, roles: Vec<Role>) -> User {
        self.users
            .create(
                uuid::Uuid::nil(),
                NewUser {
                    name: "Seeded".to_string(),
                    email: Email::parse(email).unwrap(),
                    roles,
                    department: None,
                    password: password.to_string(),
                },
            )
            .await
            .unwrap()
    }

    /// Signs a token for `user` with the roles it holds.
    pub fn token_for(&self, user: &User) -> String {
        let claims = self
            .auth
            .new_claims(user.id, Role::to_strings(&user.roles), 3600);
        self.auth.generate_token(KID, &claims).unwrap()
    }

    pub fn auth_app(&self) -> Router {
        routes::auth_app(AuthConfig {
            build: "test".to_string(),
            auth: self.auth.clone(),
            users: self.users.clone(),
            db: Arc::new(self.db.clone()),
            metrics: self.metrics.clone(),
            request_timeout: Duration::from_secs(30),
            cors_origins: vec!["*".to_string()],
        })
    }

    pub fn sales_app(&self, auth: Arc<dyn Authenticator>) -> Router {
        routes::sales_app(SalesConfig {
            build: "test".to_string(),
            auth,
            users: self.users.clone(),
            db: Arc::new(self.db.clone()),
            metrics: self.metrics.clone(),
            identity_cache: None,
            request_timeout: Duration::from_secs(30),
            cors_origins: vec!["*".to_string()],
        })
    }
}

/// Serves `router` on an ephemeral local port and returns its base url.
pub async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
