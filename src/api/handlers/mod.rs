//! API request handlers.
//!
//! Each function returns a pipeline [`HandlerFunc`](crate::web::HandlerFunc)
//! closed over the services it needs.

/// Token, authenticate and authorize handlers of the auth service.
pub mod auth;
/// Liveness, readiness and debug handlers.
pub mod check;
/// User create and delete handlers of the sales service.
pub mod users;
