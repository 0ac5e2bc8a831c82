//! Role model - flat, globally named capabilities held by users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Role that bypasses organization membership checks and gates admin operations.
pub const ADMIN_ROLE: &str = "admin";

/// Roles seeded at startup. Re-seeding never touches existing rows.
pub const DEFAULT_ROLES: &[(&str, &str)] = &[
    (ADMIN_ROLE, "Full administrative access"),
    ("manager", "Manages organizations and their members"),
    ("editor", "Creates and edits content"),
    ("reader", "Read-only access"),
];

/// Role entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Role {
    pub role_id: Uuid,
    pub role_name: String,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    /// Create a new role.
    pub fn new(role_name: String, description: Option<String>) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            role_name,
            description,
            created_utc: Utc::now(),
        }
    }
}

/// UserRole join row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_utc: DateTime<Utc>,
}

/// Partial update of a role. Renaming keeps the id, so assignments survive.
#[derive(Debug, Clone, Default)]
pub struct RoleChanges {
    pub role_name: Option<String>,
    pub description: Option<String>,
}
