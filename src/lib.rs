//! # Gatehouse
//!
//! Token issuing, policy-driven authorization and a composable request
//! pipeline for multi-service backends.
//!
//! ## Overview
//!
//! Gatehouse can be used in two ways:
//!
//! 1. **As a standalone server** - Run the `gatehouse-server` binary as the
//!    auth service or as the sales service that delegates to it
//! 2. **As a library** - Mount the pipeline and auth middleware in your own
//!    axum service
//!
//! ## Quick Start (Library Usage)
//!
//! ```rust,ignore
//! use gatehouse::auth::{client::AuthClient, middleware, policy::RULE_ADMIN_ONLY};
//! use gatehouse::web::{handler, mid, App};
//! use std::sync::Arc;
//!
//! let auth: Arc<dyn middleware::Authenticator> = Arc::new(AuthClient::new("http://auth:6000"));
//!
//! let mut app = App::new(vec![mid::logger(), mid::errors(), mid::panics()]);
//! app.handle(
//!     MethodFilter::GET,
//!     "v1",
//!     "/reports",
//!     reports_handler,
//!     vec![middleware::authenticate(auth.clone()), middleware::authorize(auth, RULE_ADMIN_ONLY)],
//! );
//! let router = app.into_router();
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `local-db` | Local SQLite identity store via libsql (default) |
//! | `minimal` | In-memory identity store only |
//!
//! ## Modules
//!
//! - [`web`] - Request pipeline: handlers, middleware, route table
//! - [`auth`] - Key store, token engine, policy evaluator, remote client
//! - [`users`] - Identity business layer, stores and identity cache
//! - [`api`] - Route tables and handlers of both services
//! - [`types`] - Claims, wire payloads and error handling

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// HTTP API handlers and routes.
pub mod api;
/// Token engine, policy evaluation and auth middleware.
pub mod auth;
/// Command line interface.
pub mod cli;
/// Transaction seam and the libsql database.
pub mod db;
/// In-process action registry.
pub mod delegate;
/// Process request counters.
pub mod metrics;
/// Core types (claims, payloads, errors).
pub mod types;
/// Identity business layer and stores.
pub mod users;
/// Configuration utilities (TOML).
pub mod utils;
/// Request pipeline primitives and middleware.
pub mod web;

// Re-export commonly used types
pub use auth::client::AuthClient;
pub use auth::jwt::AuthService;
pub use auth::keystore::KeyStore;
pub use auth::middleware::Authenticator;
pub use auth::policy::PolicyEvaluator;
pub use types::{AppError, Claims, Result};
pub use users::cache::ShardedCache;
pub use utils::config::GatehouseConfig;
pub use web::{App, HandlerFunc, MidFunc};
