//! HTTP API Handlers and Routes
//!
//! # Module Structure
//!
//! - [`api::handlers`](crate::api::handlers) - Request handlers for each endpoint
//! - [`api::routes`](crate::api::routes) - Route tables for the auth and sales services
//!
//! # API Endpoints
//!
//! ## Auth service
//! - `GET /v1/auth/token/{kid}` - Basic credential, returns a signed token
//! - `GET /v1/auth/authenticate` - Bearer token, returns the identity and claims
//! - `POST /v1/auth/authorize` - Evaluates a rule for another service, 204 when allowed
//!
//! ## Sales service
//! - `POST /v1/users` - Create a user (admin only)
//! - `DELETE /v1/users/{user_id}` - Delete a user (admin or the user themself)
//!
//! ## Both
//! - `GET /v1/liveness`, `GET /v1/readiness` - Probes, no middleware
//! - `GET /debug/vars` - Request counters
//!
//! # Errors
//!
//! Every error is returned as `{"code": "...", "message": "..."}` with the
//! single status its code maps to.

/// Request handlers for all API endpoints.
pub mod handlers;
/// Route tables.
pub mod routes;
