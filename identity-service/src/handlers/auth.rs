use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::auth::{
        AuthorizeQuery, AuthorizeResponse, GoogleCallbackQuery, LoginRedirectResponse,
        LoginResponse, LogoutRequest, MeResponse, RefreshRequest, RefreshResponse,
    },
    middleware::{AuthUser, BearerToken},
    utils::{ValidatedJson, ValidatedQuery},
    AppState,
};

/// Start a Google login
#[utoipa::path(
    get,
    path = "/auth/login",
    responses(
        (status = 200, description = "Authorization URL and state to round-trip", body = LoginRedirectResponse),
        (status = 503, description = "State store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn begin_login(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let redirect = state.facade.begin_login().await?;
    Ok(Json(LoginRedirectResponse::from(redirect)))
}

/// Complete a Google login
#[utoipa::path(
    get,
    path = "/auth/google/callback",
    params(GoogleCallbackQuery),
    responses(
        (status = 200, description = "Session issued", body = LoginResponse),
        (status = 400, description = "Unknown, expired or reused state", body = ErrorResponse),
        (status = 401, description = "Authorization code rejected", body = ErrorResponse),
        (status = 409, description = "Email registered to another identity", body = ErrorResponse),
        (status = 502, description = "Identity provider unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn google_callback(
    State(state): State<AppState>,
    Query(query): Query<GoogleCallbackQuery>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(error) = query.error {
        tracing::warn!(error = %error, "Google returned an authorization error");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Authorization denied: {}",
            error
        )));
    }

    let oauth_state = query
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing OAuth state")))?;
    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing authorization code")))?;

    let login = state.facade.complete_login(&code, &oauth_state).await?;
    Ok((StatusCode::OK, Json(LoginResponse::from(login))))
}

/// Rotate a refresh token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token rotated", body = RefreshResponse),
        (status = 401, description = "Invalid, expired or reused token; reuse revokes the session", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state.facade.refresh(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(RefreshResponse::from(res))))
}

/// Revoke the session a refresh token belongs to
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Session revoked"),
        (status = 404, description = "Unknown refresh token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LogoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.facade.logout(&req.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Current user with live roles and memberships
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Current user", body = MeResponse),
        (status = 401, description = "Missing, invalid or expired access token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn me(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    let user = state.facade.current_user(&token).await?;
    let roles = state
        .facade
        .effective_permissions(user.user_id)
        .await?
        .into_iter()
        .collect();
    let organizations = state.facade.memberships(user.user_id).await?;

    Ok(Json(MeResponse {
        user,
        roles,
        organizations,
    }))
}

/// Check a role against live assignments
#[utoipa::path(
    get,
    path = "/auth/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 200, description = "Decision", body = AuthorizeResponse),
        (status = 401, description = "Missing, invalid or expired access token", body = ErrorResponse)
    ),
    tag = "Authorization",
    security(("bearer_auth" = []))
)]
pub async fn authorize(
    State(state): State<AppState>,
    auth: AuthUser,
    ValidatedQuery(query): ValidatedQuery<AuthorizeQuery>,
) -> Result<impl IntoResponse, AppError> {
    let decision = state
        .facade
        .check_access(auth.user_id, &query.role, query.organization_id)
        .await?;

    Ok(Json(AuthorizeResponse {
        decision,
        role: query.role,
        organization_id: query.organization_id,
    }))
}
