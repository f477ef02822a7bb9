//! Token and Policy Authentication
//!
//! This module holds the authentication and authorization engine shared by
//! the auth service and by every service that delegates to it.
//!
//! # Module Structure
//!
//! - [`auth::keystore`](crate::auth::keystore) - kid to PEM key material
//! - [`auth::jwt`](crate::auth::jwt) - RS256 token signing and verification
//! - [`auth::policy`](crate::auth::policy) - Rego rule evaluation
//! - [`auth::client`](crate::auth::client) - HTTP client for a remote auth service
//! - [`auth::middleware`](crate::auth::middleware) - pipeline middleware
//!
//! # Usage
//!
//! ```ignore
//! use gatehouse::auth::{jwt::AuthService, keystore::KeyStore};
//!
//! let mut keys = KeyStore::new();
//! keys.load_by_file_system(Path::new("zarf/keys"))?;
//! let auth = AuthService::new(Arc::new(keys), "service project")?;
//!
//! let claims = auth.new_claims(user_id, vec!["ADMIN".into()], 3600);
//! let token = auth.generate_token(kid, &claims)?;
//! let parsed = auth.authenticate(&format!("Bearer {}", token))?;
//! ```
//!
//! A service without key material builds an
//! [`AuthClient`](crate::auth::client::AuthClient) instead and passes it to
//! the same [`middleware::authenticate`] and [`middleware::authorize`]
//! middleware.

/// Remote auth service client.
pub mod client;
/// RS256 token engine.
pub mod jwt;
/// Private key storage by kid.
pub mod keystore;
/// Authentication and authorization middleware.
pub mod middleware;
/// Rego policy evaluation.
pub mod policy;
