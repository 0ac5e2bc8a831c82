//! Organization model and the membership join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Organization entity. Lifecycle is entirely admin-driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Organization {
    pub org_id: Uuid,
    pub org_name: String,
    pub description: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Organization {
    /// Create a new organization.
    pub fn new(
        org_name: String,
        description: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            org_id: Uuid::new_v4(),
            org_name,
            description,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Partial update of an organization.
#[derive(Debug, Clone, Default)]
pub struct OrganizationChanges {
    pub org_name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// UserOrganization join row. The label is per membership and unrelated to
/// global roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct OrgMembership {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub membership_label: String,
    pub joined_utc: DateTime<Utc>,
}

impl OrgMembership {
    pub fn new(user_id: Uuid, org_id: Uuid, membership_label: String) -> Self {
        Self {
            user_id,
            org_id,
            membership_label,
            joined_utc: Utc::now(),
        }
    }
}
