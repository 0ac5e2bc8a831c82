use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::{OrgMembership, User};
use crate::services::{Decision, LoginResult, LoginRedirect, RefreshResult};

pub const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginRedirectResponse {
    #[schema(example = "https://accounts.google.com/o/oauth2/v2/auth?client_id=...")]
    pub auth_url: String,
    #[schema(example = "q2nq3hBWmJHl0dyv9cRDz3xJ4fVQ3mJ9n8jC-9_4Skw")]
    pub state: String,
}

impl From<LoginRedirect> for LoginRedirectResponse {
    fn from(redirect: LoginRedirect) -> Self {
        Self {
            auth_url: redirect.auth_url,
            state: redirect.state,
        }
    }
}

/// Query Google appends to the redirect URI. `error` replaces `code` when the
/// user declines consent.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct GoogleCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 900)]
    pub expires_in: i64,
    pub is_new_user: bool,
    pub user: User,
}

impl From<LoginResult> for LoginResponse {
    fn from(login: LoginResult) -> Self {
        Self {
            access_token: login.access_token,
            refresh_token: login.refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: login.expires_in,
            is_new_user: login.is_new_user,
            user: login.user,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    #[schema(example = "1b3c9c1f0d5e4bd1a9f0...")]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 900)]
    pub expires_in: i64,
}

impl From<RefreshResult> for RefreshResponse {
    fn from(refresh: RefreshResult) -> Self {
        Self {
            access_token: refresh.access_token,
            refresh_token: refresh.refresh_token,
            token_type: TOKEN_TYPE.to_string(),
            expires_in: refresh.expires_in,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct LogoutRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub user: User,
    /// Live role names, which may differ from the token's snapshot.
    #[schema(example = json!(["admin", "reader"]))]
    pub roles: Vec<String>,
    pub organizations: Vec<OrgMembership>,
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeQuery {
    #[validate(length(min = 1, message = "Role is required"))]
    #[param(example = "editor")]
    pub role: String,
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizeResponse {
    pub decision: Decision,
    #[schema(example = "editor")]
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
}
