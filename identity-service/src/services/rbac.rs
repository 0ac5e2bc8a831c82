//! Flat RBAC: a user's permissions are exactly the set of role names they hold.
//!
//! No hierarchy and no implication between roles. Organization-scoped checks
//! additionally require membership, which the `admin` role bypasses. Every
//! decision reads the store, so assignment changes are visible immediately.

use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::store::AccessStore;
use super::{metrics, ServiceError};
use crate::models::ADMIN_ROLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    fn from_bool(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Decision::Allowed => "allowed",
            Decision::Denied => "denied",
        }
    }
}

pub struct RbacAuthorizer {
    access: Arc<dyn AccessStore>,
}

impl RbacAuthorizer {
    pub fn new(access: Arc<dyn AccessStore>) -> Self {
        Self { access }
    }

    pub async fn effective_permissions(
        &self,
        user_id: Uuid,
    ) -> Result<BTreeSet<String>, ServiceError> {
        Ok(self
            .access
            .role_names_for_user(user_id)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn authorize(
        &self,
        user_id: Uuid,
        required_role: &str,
    ) -> Result<Decision, ServiceError> {
        let held = self.effective_permissions(user_id).await?;
        let decision = Decision::from_bool(held.contains(required_role));
        metrics::record_decision(decision.as_str());
        tracing::debug!(%user_id, required_role, decision = decision.as_str(), "Authorization decision");
        Ok(decision)
    }

    /// Role check scoped to an organization: the role is required, and so is
    /// membership unless the user is an admin.
    pub async fn authorize_in_organization(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        required_role: &str,
    ) -> Result<Decision, ServiceError> {
        let held = self.effective_permissions(user_id).await?;
        let allowed = held.contains(required_role)
            && (held.contains(ADMIN_ROLE)
                || self.access.find_membership(user_id, org_id).await?.is_some());

        let decision = Decision::from_bool(allowed);
        metrics::record_decision(decision.as_str());
        tracing::debug!(%user_id, %org_id, required_role, decision = decision.as_str(), "Authorization decision");
        Ok(decision)
    }

    /// Gate for admin operations. Denial is `Forbidden`.
    pub async fn require_admin(&self, actor_id: Uuid) -> Result<(), ServiceError> {
        if self.authorize(actor_id, ADMIN_ROLE).await?.is_allowed() {
            Ok(())
        } else {
            tracing::warn!(actor_id = %actor_id, "Admin operation denied");
            Err(ServiceError::Forbidden("admin role required".to_string()))
        }
    }
}
