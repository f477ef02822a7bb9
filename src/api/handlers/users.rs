use crate::auth::middleware::USER_ID_PARAM;
use crate::types::{AppError, Result};
use crate::users::{Email, ExtBusiness, NewUser, Role, User};
use crate::web::{decode, handler, path_param, HandlerFunc};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// A user as returned to callers. The password hash never leaves the
/// service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    /// User id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Role names.
    pub roles: Vec<String>,
    /// Department, empty when unset.
    pub department: String,
    /// Disabled users cannot sign in.
    pub enabled: bool,
    /// RFC 3339 creation time.
    pub date_created: String,
    /// RFC 3339 last update time.
    pub date_updated: String,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.to_string(),
            roles: Role::to_strings(&user.roles),
            department: user.department.clone().unwrap_or_default(),
            enabled: user.enabled,
            date_created: user.date_created.to_rfc3339(),
            date_updated: user.date_updated.to_rfc3339(),
        }
    }
}

/// Request body for creating a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUserRequest {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
    /// Role names, `ADMIN` or `USER`.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Optional department.
    #[serde(default)]
    pub department: String,
    /// Plain-text password.
    #[serde(default)]
    pub password: String,
    /// Must equal `password`.
    #[serde(default)]
    pub password_confirm: String,
}

impl NewUserRequest {
    /// Checks required fields. Missing data is `FailedPrecondition`.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("name", self.name.trim().is_empty()),
            ("email", self.email.trim().is_empty()),
            ("roles", self.roles.is_empty()),
            ("password", self.password.is_empty()),
        ]
        .into_iter()
        .filter_map(|(field, empty)| empty.then_some(field))
        .collect();

        if !missing.is_empty() {
            return Err(AppError::FailedPrecondition(format!(
                "validate: required fields missing: {}",
                missing.join(", ")
            )));
        }

        if self.password != self.password_confirm {
            return Err(AppError::FailedPrecondition(
                "validate: passwordConfirm must match password".to_string(),
            ));
        }

        Ok(())
    }

    /// Converts to the business type. Unparsable values are `InvalidArgument`.
    pub fn into_new_user(self) -> Result<NewUser> {
        let roles = self
            .roles
            .iter()
            .map(|r| Role::from_str(r))
            .collect::<Result<Vec<_>>>()?;

        Ok(NewUser {
            name: self.name,
            email: Email::parse(&self.email)?,
            roles,
            department: (!self.department.is_empty()).then_some(self.department),
            password: self.password,
        })
    }
}

/// Creates a user inside the request's transaction.
pub fn create(users: Arc<dyn ExtBusiness>) -> HandlerFunc {
    handler(move |scope, req| {
        let users = users.clone();
        async move {
            let body: NewUserRequest = decode(req).await?;
            body.validate()?;
            let nu = body.into_new_user()?;

            let bus = users.with_tx(scope.transaction()?)?;
            let user = bus.create(scope.user_id()?, nu).await?;

            Ok((StatusCode::CREATED, Json(UserResponse::from(&user))).into_response())
        }
    })
}

/// Deletes the user named in the path inside the request's transaction.
pub fn delete(users: Arc<dyn ExtBusiness>) -> HandlerFunc {
    handler(move |scope, req| {
        let users = users.clone();
        async move {
            let (_, id) = path_param(req, USER_ID_PARAM).await;
            let id = id.unwrap_or_default();
            let user_id = Uuid::parse_str(&id)
                .map_err(|_| AppError::InvalidArgument(format!("invalid user id [{}]", id)))?;

            let bus = users.with_tx(scope.transaction()?)?;
            let user = bus.query_by_id(user_id).await?;
            bus.delete(scope.user_id()?, &user).await?;

            Ok(StatusCode::NO_CONTENT.into_response())
        }
    })
}
