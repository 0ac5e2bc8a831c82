//! Domain events describing identity and authorization state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{Organization, OrgMembership, Role, User};

/// Namespace for deterministic event ids.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x3b2a_9c4e_5d6f_4a1b_8c7d_9e0f_1a2b_3c4d);

/// Domain event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainEventType {
    #[serde(rename = "user.created")]
    UserCreated,
    #[serde(rename = "user.logged_in")]
    UserLoggedIn,
    #[serde(rename = "role.assigned")]
    RoleAssigned,
    #[serde(rename = "role.removed")]
    RoleRemoved,
    #[serde(rename = "organization.assigned")]
    OrganizationAssigned,
    #[serde(rename = "organization.removed")]
    OrganizationRemoved,
    #[serde(rename = "token.reuse_detected")]
    TokenReuseDetected,
}

impl DomainEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEventType::UserCreated => "user.created",
            DomainEventType::UserLoggedIn => "user.logged_in",
            DomainEventType::RoleAssigned => "role.assigned",
            DomainEventType::RoleRemoved => "role.removed",
            DomainEventType::OrganizationAssigned => "organization.assigned",
            DomainEventType::OrganizationRemoved => "organization.removed",
            DomainEventType::TokenReuseDetected => "token.reuse_detected",
        }
    }
}

impl std::str::FromStr for DomainEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user.created" => Ok(DomainEventType::UserCreated),
            "user.logged_in" => Ok(DomainEventType::UserLoggedIn),
            "role.assigned" => Ok(DomainEventType::RoleAssigned),
            "role.removed" => Ok(DomainEventType::RoleRemoved),
            "organization.assigned" => Ok(DomainEventType::OrganizationAssigned),
            "organization.removed" => Ok(DomainEventType::OrganizationRemoved),
            "token.reuse_detected" => Ok(DomainEventType::TokenReuseDetected),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

impl std::fmt::Display for DomainEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable event handed to the bus.
///
/// `event_id` is a function of (type, subject, object, causal operation): the
/// object is the role, organization or session the event is about. A
/// republished event keeps its id, and two mutations of different objects
/// under one operation never share one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: DomainEventType,
    pub subject_user_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_utc: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        event_type: DomainEventType,
        subject_user_id: Uuid,
        object_id: Uuid,
        causal_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Self::derive_id(event_type, subject_user_id, object_id, causal_id),
            event_type,
            subject_user_id,
            payload,
            occurred_utc: Utc::now(),
        }
    }

    pub fn derive_id(
        event_type: DomainEventType,
        subject_user_id: Uuid,
        object_id: Uuid,
        causal_id: Uuid,
    ) -> Uuid {
        let name = format!(
            "{}:{}:{}:{}",
            event_type.as_str(),
            subject_user_id,
            object_id,
            causal_id
        );
        Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
    }

    pub fn user_created(user: &User) -> Self {
        Self::new(
            DomainEventType::UserCreated,
            user.user_id,
            user.user_id,
            user.user_id,
            json!({
                "email": user.email,
                "display_name": user.display_name,
                "provider": user.ident_provider_code,
            }),
        )
    }

    /// `family_id` is the session the login opened.
    pub fn user_logged_in(user: &User, family_id: Uuid) -> Self {
        Self::new(
            DomainEventType::UserLoggedIn,
            user.user_id,
            family_id,
            family_id,
            json!({
                "email": user.email,
                "session_family_id": family_id,
            }),
        )
    }

    pub fn role_assigned(user_id: Uuid, role: &Role, actor_id: Uuid, operation_id: Uuid) -> Self {
        Self::new(
            DomainEventType::RoleAssigned,
            user_id,
            role.role_id,
            operation_id,
            json!({
                "role_id": role.role_id,
                "role_name": role.role_name,
                "actor_user_id": actor_id,
            }),
        )
    }

    pub fn role_removed(user_id: Uuid, role: &Role, actor_id: Uuid, operation_id: Uuid) -> Self {
        Self::new(
            DomainEventType::RoleRemoved,
            user_id,
            role.role_id,
            operation_id,
            json!({
                "role_id": role.role_id,
                "role_name": role.role_name,
                "actor_user_id": actor_id,
            }),
        )
    }

    pub fn organization_assigned(
        membership: &OrgMembership,
        org: &Organization,
        actor_id: Uuid,
        operation_id: Uuid,
    ) -> Self {
        Self::new(
            DomainEventType::OrganizationAssigned,
            membership.user_id,
            org.org_id,
            operation_id,
            json!({
                "org_id": org.org_id,
                "org_name": org.org_name,
                "membership_label": membership.membership_label,
                "actor_user_id": actor_id,
            }),
        )
    }

    pub fn organization_removed(
        user_id: Uuid,
        org: &Organization,
        actor_id: Uuid,
        operation_id: Uuid,
    ) -> Self {
        Self::new(
            DomainEventType::OrganizationRemoved,
            user_id,
            org.org_id,
            operation_id,
            json!({
                "org_id": org.org_id,
                "org_name": org.org_name,
                "actor_user_id": actor_id,
            }),
        )
    }

    /// `token_id` is the replayed token.
    pub fn token_reuse_detected(user_id: Uuid, family_id: Uuid, token_id: Uuid) -> Self {
        Self::new(
            DomainEventType::TokenReuseDetected,
            user_id,
            family_id,
            token_id,
            json!({
                "session_family_id": family_id,
                "replayed_token_id": token_id,
            }),
        )
    }
}
