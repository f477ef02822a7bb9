use crate::auth::jwt::AuthService;
use crate::types::{AppError, AuthenticateResp, AuthorizeRequest, TokenResponse};
use crate::web::{decode, handler, path_param, HandlerFunc};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;
use tracing::info;

/// Path parameter naming the signing key.
pub const KID_PARAM: &str = "kid";

/// Signs the caller's claims, attached by the basic middleware, under the
/// kid named in the path.
pub fn token(auth: Arc<AuthService>) -> HandlerFunc {
    handler(move |scope, req| {
        let auth = auth.clone();
        async move {
            let (_, kid) = path_param(req, KID_PARAM).await;
            let kid = match kid {
                Some(kid) if !kid.is_empty() => kid,
                _ => return Err(AppError::FailedPrecondition("missing kid".to_string())),
            };

            let claims = scope.claims()?;
            let token = auth.generate_token(&kid, claims)?;

            info!(trace_id = %scope.trace_id(), %kid, sub = %claims.sub, "token issued");
            Ok(Json(TokenResponse { token }).into_response())
        }
    })
}

/// Returns the identity and claims the bearer middleware resolved.
pub fn authenticate() -> HandlerFunc {
    handler(|scope, _| async move {
        let resp = AuthenticateResp {
            user_id: scope.user_id()?,
            claims: scope.claims()?.clone(),
        };

        Ok(Json(resp).into_response())
    })
}

/// Evaluates an authorization request on behalf of another service.
pub fn authorize(auth: Arc<AuthService>) -> HandlerFunc {
    handler(move |_, req| {
        let auth = auth.clone();
        async move {
            let areq: AuthorizeRequest = decode(req).await?;

            auth.authorize(&areq.claims, areq.user_id, &areq.rule)?;

            Ok(StatusCode::NO_CONTENT.into_response())
        }
    })
}
