use crate::auth::jwt::AuthService;
use crate::auth::middleware::Authenticator;
use crate::types::{AppError, AuthenticateResp, AuthorizeRequest, Result};
use crate::web::TRACE_ID_HEADER;
use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default bound on a remote authorize call.
pub const DEFAULT_AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a remote auth service, for services that hold no key material.
///
/// Every failure, whether transport, non-2xx status or timeout, is reported
/// as `Unauthenticated`: the caller cannot tell a denial from an unconfirmed
/// decision and must fail closed either way.
#[derive(Clone)]
pub struct AuthClient {
    base_url: String,
    client: reqwest::Client,
    authorize_timeout: Duration,
}

impl AuthClient {
    /// Client for the auth service at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Same as [`AuthClient::new`] over an existing client.
    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            authorize_timeout: DEFAULT_AUTHORIZE_TIMEOUT,
        }
    }

    /// Bounds the authorize round trip.
    pub fn with_authorize_timeout(mut self, timeout: Duration) -> Self {
        self.authorize_timeout = timeout;
        self
    }

    /// Forwards `auth_header` to the remote authenticate endpoint.
    pub async fn authenticate(&self, trace_id: Uuid, auth_header: &str) -> Result<AuthenticateResp> {
        let url = format!("{}/v1/auth/authenticate", self.base_url);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, auth_header)
            .header(TRACE_ID_HEADER, trace_id.to_string())
            .send()
            .await
            .map_err(|e| unauthenticated("authenticate", e))?;

        if !response.status().is_success() {
            return Err(AppError::Unauthenticated(format!(
                "authenticate: auth service returned {}",
                response.status()
            )));
        }

        let resp: AuthenticateResp = response
            .json()
            .await
            .map_err(|e| unauthenticated("decode authenticate", e))?;

        debug!(%trace_id, user_id = %resp.user_id, "remote authenticate ok");
        Ok(resp)
    }

    /// Asks the remote authorize endpoint for a decision, bounded by the
    /// configured timeout.
    pub async fn authorize(&self, trace_id: Uuid, req: &AuthorizeRequest) -> Result<()> {
        let url = format!("{}/v1/auth/authorize", self.base_url);

        let call = self
            .client
            .post(&url)
            .header(TRACE_ID_HEADER, trace_id.to_string())
            .json(req)
            .send();

        let response = match tokio::time::timeout(self.authorize_timeout, call).await {
            Ok(sent) => sent.map_err(|e| unauthenticated("authorize", e))?,
            Err(_) => {
                warn!(%trace_id, rule = %req.rule, timeout = ?self.authorize_timeout, "remote authorize timed out");
                return Err(AppError::Unauthenticated(format!(
                    "authorize: no decision within {:?}",
                    self.authorize_timeout
                )));
            }
        };

        if !response.status().is_success() {
            return Err(AppError::Unauthenticated(format!(
                "authorize: rule[{}] denied with {}",
                req.rule,
                response.status()
            )));
        }

        Ok(())
    }
}

fn unauthenticated(op: &str, e: reqwest::Error) -> AppError {
    AppError::Unauthenticated(format!("{}: {}", op, e))
}

#[async_trait]
impl Authenticator for AuthClient {
    async fn authenticate(&self, trace_id: Uuid, auth_header: &str) -> Result<AuthenticateResp> {
        AuthClient::authenticate(self, trace_id, auth_header).await
    }

    async fn authorize(&self, trace_id: Uuid, req: &AuthorizeRequest) -> Result<()> {
        AuthClient::authorize(self, trace_id, req).await
    }
}

#[async_trait]
impl Authenticator for AuthService {
    async fn authenticate(&self, _trace_id: Uuid, auth_header: &str) -> Result<AuthenticateResp> {
        let claims = AuthService::authenticate(self, auth_header)?;
        let user_id = claims
            .subject_id()
            .map_err(|e| AppError::Unauthenticated(e.to_string()))?
            .ok_or_else(|| {
                AppError::Unauthenticated(
                    "authorize: you are not authorized for that action, no claim".to_string(),
                )
            })?;

        Ok(AuthenticateResp { user_id, claims })
    }

    async fn authorize(&self, _trace_id: Uuid, req: &AuthorizeRequest) -> Result<()> {
        AuthService::authorize(self, &req.claims, req.user_id, &req.rule)
    }
}
