use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::models::{OrganizationChanges, RoleChanges};
use crate::services::AssignmentOutcome;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListUsersQuery {
    #[validate(range(min = 1, max = 200, message = "Limit must be between 1 and 200"))]
    pub limit: Option<i64>,
    #[validate(range(min = 0, message = "Offset must not be negative"))]
    pub offset: Option<i64>,
}

impl ListUsersQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AssignmentResponse {
    pub outcome: AssignmentOutcome,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct AssignOrganizationRequest {
    #[validate(length(max = 64, message = "Membership label is too long"))]
    #[schema(example = "owner")]
    pub membership_label: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    #[schema(example = "auditor")]
    pub role_name: String,
    #[schema(example = "Reads audit trails")]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    pub role_name: Option<String>,
    pub description: Option<String>,
}

impl From<UpdateRoleRequest> for RoleChanges {
    fn from(req: UpdateRoleRequest) -> Self {
        RoleChanges {
            role_name: req.role_name,
            description: req.description,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 128, message = "Organization name must be 1-128 characters"))]
    #[schema(example = "Acme Corp")]
    pub org_name: String,
    pub description: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateOrganizationRequest {
    #[validate(length(min = 1, max = 128, message = "Organization name must be 1-128 characters"))]
    pub org_name: Option<String>,
    pub description: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

impl From<UpdateOrganizationRequest> for OrganizationChanges {
    fn from(req: UpdateOrganizationRequest) -> Self {
        OrganizationChanges {
            org_name: req.org_name,
            description: req.description,
            metadata: req.metadata,
        }
    }
}
