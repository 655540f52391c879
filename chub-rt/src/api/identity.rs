//! Caller identity
//!
//! Sessions belong to the surrounding application. It forwards the
//! authenticated user's id in the `x-user-id` header; the id must name a
//! known user.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use chub_common::db::models::User;
use chub_common::Error;
use uuid::Uuid;

use super::ApiError;
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The user making the request
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::Unauthorized(format!("Missing {} header", USER_ID_HEADER)))?;
        let user_id = Uuid::parse_str(raw.trim())
            .map_err(|_| Error::Unauthorized(format!("Malformed {} header", USER_ID_HEADER)))?;

        let user = state
            .storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::Unauthorized(format!("Unknown user {}", user_id)))?;
        Ok(CurrentUser(user))
    }
}

/// A caller with the admin role; anyone else gets 403
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(Error::Forbidden("Admin role required".to_string()).into());
        }
        Ok(AdminUser(user))
    }
}
