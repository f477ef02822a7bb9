use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============= Token Types =============

/// The authorization claims carried in the payload of a signed token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer of the token.
    pub iss: String,
    /// Subject: the identity id, empty when the token is not bound to one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    /// Roles granted to the subject.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expires at (seconds since epoch).
    pub exp: i64,
}

impl Claims {
    /// Builds claims for `subject` valid for `ttl_secs` from now.
    pub fn new(issuer: &str, subject: Uuid, roles: Vec<String>, ttl_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            iss: issuer.to_string(),
            sub: subject.to_string(),
            roles,
            iat: now,
            exp: now + ttl_secs,
        }
    }

    /// Checks whether the specified role was granted.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Parses the subject as an identity id.
    ///
    /// Returns `None` when the subject is absent.
    pub fn subject_id(&self) -> Result<Option<Uuid>> {
        if self.sub.is_empty() {
            return Ok(None);
        }
        Uuid::parse_str(&self.sub)
            .map(Some)
            .map_err(|e| AppError::InvalidArgument(format!("parsing subject: {}", e)))
    }

    /// Enforces the shape every signed token must have.
    pub fn validate(&self) -> Result<()> {
        if self.exp <= self.iat {
            return Err(AppError::InvalidArgument(format!(
                "expires-at [{}] must be after issued-at [{}]",
                self.exp, self.iat
            )));
        }
        self.subject_id()?;
        Ok(())
    }
}

// ============= API Request/Response Types =============

/// Response of the token endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Signed RS256 token.
    pub token: String,
}

/// Identity resolved by the authenticate endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResp {
    /// Subject of the token.
    #[serde(rename = "userID")]
    pub user_id: Uuid,
    /// Verified claims.
    pub claims: Claims,
}

/// Body of the authorize endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    /// Claims of the caller.
    pub claims: Claims,
    /// User the action targets.
    #[serde(rename = "userID")]
    pub user_id: Uuid,
    /// Authorization rule to evaluate.
    pub rule: String,
}

/// Wire shape of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error category.
    pub code: ErrCode,
    /// Caller-visible message.
    pub message: String,
}

// ============= Error Types =============

/// Machine-readable error code returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrCode {
    /// Malformed input.
    InvalidArgument,
    /// Input failed a business rule.
    FailedPrecondition,
    /// Missing or rejected credentials.
    Unauthenticated,
    /// No such entity.
    NotFound,
    /// Conflicting write.
    Aborted,
    /// Request ran past its deadline.
    DeadlineExceeded,
    /// Server-side failure.
    Internal,
    /// Server-side failure whose detail is withheld.
    InternalOnlyLog,
    /// Unclassified failure.
    Unknown,
}

impl ErrCode {
    /// The single HTTP status this code is reported with.
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrCode::InvalidArgument | ErrCode::FailedPrecondition => StatusCode::BAD_REQUEST,
            ErrCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrCode::NotFound => StatusCode::NOT_FOUND,
            ErrCode::Aborted => StatusCode::CONFLICT,
            ErrCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrCode::Internal | ErrCode::InternalOnlyLog | ErrCode::Unknown => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Snake case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrCode::InvalidArgument => "invalid_argument",
            ErrCode::FailedPrecondition => "failed_precondition",
            ErrCode::Unauthenticated => "unauthenticated",
            ErrCode::NotFound => "not_found",
            ErrCode::Aborted => "aborted",
            ErrCode::DeadlineExceeded => "deadline_exceeded",
            ErrCode::Internal => "internal",
            ErrCode::InternalOnlyLog => "internal_only_log",
            ErrCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared across the crate.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Input failed a business rule.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Missing or rejected credentials.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// No such entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflicting write.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Request ran past its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Server-side failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A recovered panic. The message is logged, never returned.
    #[error("Internal fault: {0}")]
    InternalOnlyLog(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrCode {
        match self {
            AppError::InvalidArgument(_) => ErrCode::InvalidArgument,
            AppError::FailedPrecondition(_) => ErrCode::FailedPrecondition,
            AppError::Unauthenticated(_) => ErrCode::Unauthenticated,
            AppError::NotFound(_) => ErrCode::NotFound,
            AppError::Aborted(_) => ErrCode::Aborted,
            AppError::DeadlineExceeded(_) => ErrCode::DeadlineExceeded,
            AppError::Internal(_) => ErrCode::Internal,
            AppError::InternalOnlyLog(_) => ErrCode::InternalOnlyLog,
            AppError::Other(_) => ErrCode::Unknown,
        }
    }

    /// The body a caller is allowed to see.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            AppError::InvalidArgument(msg)
            | AppError::FailedPrecondition(msg)
            | AppError::Unauthenticated(msg)
            | AppError::NotFound(msg)
            | AppError::Aborted(msg)
            | AppError::DeadlineExceeded(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::InternalOnlyLog(_) => "internal server error".to_string(),
            AppError::Other(_) => "Unknown".to_string(),
        };

        ErrorBody {
            code: self.code(),
            message,
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.code().http_status();
        (status, axum::Json(self.to_body())).into_response()
    }
}

/// Result alias over [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use rstest::rstest;

    #[rstest]
    #[case(AppError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST)]
    #[case(AppError::FailedPrecondition("x".into()), StatusCode::BAD_REQUEST)]
    #[case(AppError::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED)]
    #[case(AppError::NotFound("x".into()), StatusCode::NOT_FOUND)]
    #[case(AppError::Aborted("x".into()), StatusCode::CONFLICT)]
    #[case(AppError::DeadlineExceeded("x".into()), StatusCode::GATEWAY_TIMEOUT)]
    #[case(AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(AppError::InternalOnlyLog("x".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(AppError::Other(anyhow::anyhow!("x")), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_every_kind_maps_to_one_status(#[case] err: AppError, #[case] status: StatusCode) {
        assert_eq!(err.into_response().status(), status);
    }

    #[test]
    fn test_internal_only_log_hides_detail() {
        let err = AppError::InternalOnlyLog("PANIC [boom] TRACE[frame 0 ...]".to_string());
        let body = err.to_body();

        assert_eq!(body.code, ErrCode::InternalOnlyLog);
        assert!(!body.message.contains("boom"));
        assert!(!body.message.contains("TRACE"));
    }

    #[test]
    fn test_unrecognized_error_is_unknown() {
        let err: AppError = anyhow::anyhow!("socket closed by peer").into();
        let body = err.to_body();

        assert_eq!(body.code, ErrCode::Unknown);
        assert_eq!(body.message, "Unknown");
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_value(ErrCode::FailedPrecondition).unwrap();
        assert_eq!(json, "failed_precondition");
        assert_eq!(ErrCode::Unauthenticated.to_string(), "unauthenticated");
    }

    #[test]
    fn test_claims_validate() {
        let mut claims = Claims::new("issuer", Uuid::new_v4(), vec!["USER".into()], 60);
        assert!(claims.validate().is_ok());

        claims.exp = claims.iat;
        assert!(matches!(claims.validate(), Err(AppError::InvalidArgument(_))));

        claims.exp = claims.iat + 1;
        claims.sub = "not-a-uuid".to_string();
        assert!(matches!(claims.validate(), Err(AppError::InvalidArgument(_))));

        claims.sub.clear();
        assert!(claims.validate().is_ok());
        assert_eq!(claims.subject_id().unwrap(), None);
    }

    #[test]
    fn test_claims_has_role() {
        let claims = Claims::new("issuer", Uuid::new_v4(), vec!["ADMIN".into()], 60);
        assert!(claims.has_role("ADMIN"));
        assert!(!claims.has_role("USER"));
    }
}
