//! Authentication and authorization middleware.
//!
//! [`bearer`] and [`basic`] validate credentials locally and are used by the
//! auth service itself. [`authenticate`], [`authorize`] and
//! [`authorize_user`] go through an [`Authenticator`], which is either the
//! local token engine or an [`AuthClient`](crate::auth::client::AuthClient)
//! talking to a remote auth service.

use crate::auth::jwt::AuthService;
use crate::types::{AppError, AuthenticateResp, AuthorizeRequest, Result};
use crate::users::{Email, ExtBusiness, Role};
use crate::web::{handler, middleware, path_param, MidFunc};
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use std::sync::Arc;
use uuid::Uuid;

/// Lifetime of a token minted for a basic credential: one year.
pub const BASIC_TOKEN_TTL_SECS: i64 = 8760 * 60 * 60;

/// Path parameter naming the identity a route acts on.
pub const USER_ID_PARAM: &str = "user_id";

/// Source of authentication and authorization decisions.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validates an `Authorization` header value and resolves the identity.
    async fn authenticate(&self, trace_id: Uuid, auth_header: &str) -> Result<AuthenticateResp>;

    /// Decides whether the request's claims satisfy its rule.
    async fn authorize(&self, trace_id: Uuid, req: &AuthorizeRequest) -> Result<()>;
}

fn auth_header(req: &Request) -> String {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Validates a bearer token with the local token engine.
pub fn bearer(auth: Arc<AuthService>) -> MidFunc {
    middleware(move |next| {
        let auth = auth.clone();
        handler(move |mut scope, req| {
            let next = next.clone();
            let auth = auth.clone();
            async move {
                let claims = auth.authenticate(&auth_header(&req))?;

                let user_id = claims
                    .subject_id()
                    .map_err(|e| AppError::Unauthenticated(e.to_string()))?
                    .ok_or_else(|| {
                        AppError::Unauthenticated(
                            "you are not authorized for that action, no subject".to_string(),
                        )
                    })?;

                scope.set_identity(user_id, claims);
                next(scope, req).await
            }
        })
    })
}

/// Validates an email and password credential against the user store and
/// attaches freshly built claims for that user.
pub fn basic(auth: Arc<AuthService>, users: Arc<dyn ExtBusiness>) -> MidFunc {
    middleware(move |next| {
        let auth = auth.clone();
        let users = users.clone();
        handler(move |mut scope, req| {
            let next = next.clone();
            let auth = auth.clone();
            let users = users.clone();
            async move {
                let (email, password) = parse_basic(&auth_header(&req))?;

                let email = Email::parse(&email)
                    .map_err(|e| AppError::Unauthenticated(format!("invalid email: {}", e)))?;

                let user = users.authenticate(&email, &password).await.map_err(|e| match e {
                    AppError::Unauthenticated(msg) => AppError::Unauthenticated(msg),
                    other => AppError::Unauthenticated(format!("authenticate: {}", other)),
                })?;

                let claims =
                    auth.new_claims(user.id, Role::to_strings(&user.roles), BASIC_TOKEN_TTL_SECS);

                scope.set_identity(user.id, claims);
                next(scope, req).await
            }
        })
    })
}

/// Extracts the email and password from a `Basic <base64(email:password)>`
/// header.
fn parse_basic(header: &str) -> Result<(String, String)> {
    let invalid =
        || AppError::Unauthenticated("expected authorization header format: Basic <credentials>".to_string());

    let mut parts = header.split(' ');
    let encoded = match (parts.next(), parts.next(), parts.next()) {
        (Some("Basic"), Some(encoded), None) if !encoded.is_empty() => encoded,
        _ => return Err(invalid()),
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;

    match decoded.split_once(':') {
        Some((email, password)) if !email.is_empty() => Ok((email.to_string(), password.to_string())),
        _ => Err(invalid()),
    }
}

/// Resolves the caller's identity through `auth`.
pub fn authenticate(auth: Arc<dyn Authenticator>) -> MidFunc {
    middleware(move |next| {
        let auth = auth.clone();
        handler(move |mut scope, req| {
            let next = next.clone();
            let auth = auth.clone();
            async move {
                let resp = auth.authenticate(scope.trace_id(), &auth_header(&req)).await?;

                scope.set_identity(resp.user_id, resp.claims);
                next(scope, req).await
            }
        })
    })
}

/// Requires the authenticated claims to satisfy `rule` for the caller's own
/// identity.
pub fn authorize(auth: Arc<dyn Authenticator>, rule: &str) -> MidFunc {
    let rule = rule.to_string();
    middleware(move |next| {
        let auth = auth.clone();
        let rule = rule.clone();
        handler(move |scope, req| {
            let next = next.clone();
            let auth = auth.clone();
            let rule = rule.clone();
            async move {
                let areq = AuthorizeRequest {
                    claims: scope.claims()?.clone(),
                    user_id: scope.user_id()?,
                    rule,
                };

                auth.authorize(scope.trace_id(), &areq).await?;
                next(scope, req).await
            }
        })
    })
}

/// Requires the authenticated claims to satisfy `rule` for the identity
/// named by the route's `{user_id}` parameter. Routes without the parameter
/// are checked against the nil id.
pub fn authorize_user(auth: Arc<dyn Authenticator>, rule: &str) -> MidFunc {
    let rule = rule.to_string();
    middleware(move |next| {
        let auth = auth.clone();
        let rule = rule.clone();
        handler(move |scope, req| {
            let next = next.clone();
            let auth = auth.clone();
            let rule = rule.clone();
            async move {
                let (req, param) = path_param(req, USER_ID_PARAM).await;

                let user_id = match param {
                    Some(id) => Uuid::parse_str(&id)
                        .map_err(|_| AppError::Unauthenticated(format!("invalid user id [{}]", id)))?,
                    None => Uuid::nil(),
                };

                let areq = AuthorizeRequest {
                    claims: scope.claims()?.clone(),
                    user_id,
                    rule,
                };

                auth.authorize(scope.trace_id(), &areq).await?;
                next(scope, req).await
            }
        })
    })
}
