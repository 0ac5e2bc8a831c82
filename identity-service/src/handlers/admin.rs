//! Admin surface. Every handler runs the admin check inside the facade, and
//! mutations use the request id as the causal id of the events they emit.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use service_core::{error::AppError, middleware::tracing::RequestId};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::admin::{
        AssignOrganizationRequest, AssignmentResponse, CreateOrganizationRequest,
        CreateRoleRequest, ListUsersQuery, UpdateOrganizationRequest, UpdateRoleRequest,
    },
    middleware::AuthUser,
    services::Actor,
    utils::{ValidatedJson, ValidatedQuery},
    AppState,
};

fn actor(auth: &AuthUser, request_id: &RequestId) -> Actor {
    Actor::new(auth.user_id, request_id.as_uuid())
}

// ==================== Assignments ====================

/// Grant a role to a user
#[utoipa::path(
    put,
    path = "/admin/users/{user_id}/roles/{role_id}",
    params(
        ("user_id" = Uuid, Path, description = "Target user"),
        ("role_id" = Uuid, Path, description = "Role to grant")
    ),
    responses(
        (status = 200, description = "Applied, or unchanged when already held", body = AssignmentResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User or role not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn assign_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .facade
        .assign_role(actor(&auth, &request_id), user_id, role_id)
        .await?;
    Ok(Json(AssignmentResponse { outcome }))
}

/// Remove a role from a user
#[utoipa::path(
    delete,
    path = "/admin/users/{user_id}/roles/{role_id}",
    params(
        ("user_id" = Uuid, Path, description = "Target user"),
        ("role_id" = Uuid, Path, description = "Role to remove")
    ),
    responses(
        (status = 200, description = "Applied, or unchanged when not held", body = AssignmentResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User or role not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn remove_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .facade
        .remove_role(actor(&auth, &request_id), user_id, role_id)
        .await?;
    Ok(Json(AssignmentResponse { outcome }))
}

/// Add a user to an organization
#[utoipa::path(
    put,
    path = "/admin/users/{user_id}/organizations/{org_id}",
    params(
        ("user_id" = Uuid, Path, description = "Target user"),
        ("org_id" = Uuid, Path, description = "Organization to join")
    ),
    request_body(content = Option<AssignOrganizationRequest>, description = "Optional membership label"),
    responses(
        (status = 200, description = "Applied, or unchanged when already a member", body = AssignmentResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User or organization not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn assign_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path((user_id, org_id)): Path<(Uuid, Uuid)>,
    body: Option<Json<AssignOrganizationRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    req.validate()?;

    let outcome = state
        .facade
        .assign_organization(
            actor(&auth, &request_id),
            user_id,
            org_id,
            req.membership_label,
        )
        .await?;
    Ok(Json(AssignmentResponse { outcome }))
}

/// Remove a user from an organization
#[utoipa::path(
    delete,
    path = "/admin/users/{user_id}/organizations/{org_id}",
    params(
        ("user_id" = Uuid, Path, description = "Target user"),
        ("org_id" = Uuid, Path, description = "Organization to leave")
    ),
    responses(
        (status = 200, description = "Applied, or unchanged when not a member", body = AssignmentResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User or organization not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn remove_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path((user_id, org_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .facade
        .remove_organization(actor(&auth, &request_id), user_id, org_id)
        .await?;
    Ok(Json(AssignmentResponse { outcome }))
}

// ==================== Users ====================

/// List users
#[utoipa::path(
    get,
    path = "/admin/users",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Users ordered by creation time", body = Vec<User>),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    ValidatedQuery(query): ValidatedQuery<ListUsersQuery>,
) -> Result<impl IntoResponse, AppError> {
    let users = state
        .facade
        .list_users(actor(&auth, &request_id), query.limit(), query.offset())
        .await?;
    Ok(Json(users))
}

// ==================== Roles ====================

/// List roles
#[utoipa::path(
    get,
    path = "/admin/roles",
    responses(
        (status = 200, description = "Role catalogue", body = Vec<Role>),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
) -> Result<impl IntoResponse, AppError> {
    let roles = state.facade.list_roles(actor(&auth, &request_id)).await?;
    Ok(Json(roles))
}

/// Create a role
#[utoipa::path(
    post,
    path = "/admin/roles",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 409, description = "Role name taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = state
        .facade
        .create_role(actor(&auth, &request_id), &req.role_name, req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// Rename a role or change its description
#[utoipa::path(
    patch,
    path = "/admin/roles/{role_id}",
    params(("role_id" = Uuid, Path, description = "Role to update")),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role updated", body = Role),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse),
        (status = 409, description = "Role name taken", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path(role_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = state
        .facade
        .update_role(actor(&auth, &request_id), role_id, req.into())
        .await?;
    Ok(Json(role))
}

/// Delete a role that no user holds
#[utoipa::path(
    delete,
    path = "/admin/roles/{role_id}",
    params(("role_id" = Uuid, Path, description = "Role to delete")),
    responses(
        (status = 204, description = "Role deleted"),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse),
        (status = 409, description = "Role is still assigned", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path(role_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .facade
        .delete_role(actor(&auth, &request_id), role_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Organizations ====================

/// List organizations
#[utoipa::path(
    get,
    path = "/admin/organizations",
    responses(
        (status = 200, description = "Organization catalogue", body = Vec<Organization>),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn list_organizations(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
) -> Result<impl IntoResponse, AppError> {
    let orgs = state
        .facade
        .list_organizations(actor(&auth, &request_id))
        .await?;
    Ok(Json(orgs))
}

/// Create an organization
#[utoipa::path(
    post,
    path = "/admin/organizations",
    request_body = CreateOrganizationRequest,
    responses(
        (status = 201, description = "Organization created", body = Organization),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 409, description = "Organization name taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn create_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    ValidatedJson(req): ValidatedJson<CreateOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let org = state
        .facade
        .create_organization(
            actor(&auth, &request_id),
            &req.org_name,
            req.description,
            req.metadata,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(org)))
}

/// Update an organization
#[utoipa::path(
    patch,
    path = "/admin/organizations/{org_id}",
    params(("org_id" = Uuid, Path, description = "Organization to update")),
    request_body = UpdateOrganizationRequest,
    responses(
        (status = 200, description = "Organization updated", body = Organization),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "Organization not found", body = ErrorResponse),
        (status = 409, description = "Organization name taken", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn update_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path(org_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let org = state
        .facade
        .update_organization(actor(&auth, &request_id), org_id, req.into())
        .await?;
    Ok(Json(org))
}

/// Delete an organization and its memberships
#[utoipa::path(
    delete,
    path = "/admin/organizations/{org_id}",
    params(("org_id" = Uuid, Path, description = "Organization to delete")),
    responses(
        (status = 204, description = "Organization deleted"),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "Organization not found", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn delete_organization(
    State(state): State<AppState>,
    auth: AuthUser,
    Extension(request_id): Extension<RequestId>,
    Path(org_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .facade
        .delete_organization(actor(&auth, &request_id), org_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
