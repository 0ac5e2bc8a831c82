//! Persistence seams of the identity core.
//!
//! The core owns no storage logic. These traits name the reads and the
//! atomic writes it relies on; `Database` implements them over PostgreSQL and
//! `MemoryStore` in-process.
//!
//! Mutations that emit domain events take them as an `events` argument and
//! record them in the [`EventOutbox`] in the same atomic step, so an applied
//! change never loses its event even when the bus is down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::ServiceError;
use crate::models::{
    DomainEvent, IdentProvider, OrgMembership, Organization, OrganizationChanges, RefreshFamily,
    RefreshToken, Role, RoleChanges, User,
};

/// Outcome of deleting a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleDeletion {
    Deleted,
    NotFound,
    /// Still held by this many users; nothing was deleted.
    InUse(i64),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;

    async fn find_user_by_identity(
        &self,
        provider: IdentProvider,
        subject: &str,
    ) -> Result<Option<User>, ServiceError>;

    /// Case-insensitive lookup.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError>;

    /// Insert unless the identity or the email is already taken, together
    /// with the initial `role_ids` grants and `events`. Returns `false`, having
    /// written nothing, when a uniqueness constraint rejected the row.
    async fn insert_user_if_absent(
        &self,
        user: &User,
        role_ids: &[Uuid],
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError>;

    /// Stamp a login and refresh profile fields that the provider supplied.
    async fn record_login(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
        picture_url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<User, ServiceError>;

    async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, ServiceError>;
}

#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn list_roles(&self) -> Result<Vec<Role>, ServiceError>;

    async fn find_role_by_id(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError>;

    /// Fails with `Conflict` when the name is taken.
    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError>;

    /// Insert when no role with this name exists. Returns whether it inserted.
    async fn ensure_role(&self, role: &Role) -> Result<bool, ServiceError>;

    async fn update_role(
        &self,
        role_id: Uuid,
        changes: &RoleChanges,
    ) -> Result<Option<Role>, ServiceError>;

    async fn delete_role(&self, role_id: Uuid) -> Result<RoleDeletion, ServiceError>;

    async fn role_names_for_user(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError>;

    /// Returns `false` when the assignment already existed. `events` are
    /// recorded only when a row was inserted.
    async fn insert_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError>;

    /// Returns `false` when there was nothing to remove. `events` are
    /// recorded only when a row was deleted.
    async fn delete_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError>;

    async fn list_organizations(&self) -> Result<Vec<Organization>, ServiceError>;

    async fn find_organization_by_id(
        &self,
        org_id: Uuid,
    ) -> Result<Option<Organization>, ServiceError>;

    /// Fails with `Conflict` when the name is taken.
    async fn insert_organization(&self, org: &Organization) -> Result<(), ServiceError>;

    async fn update_organization(
        &self,
        org_id: Uuid,
        changes: &OrganizationChanges,
    ) -> Result<Option<Organization>, ServiceError>;

    /// Deletes the organization and its memberships.
    async fn delete_organization(&self, org_id: Uuid) -> Result<bool, ServiceError>;

    /// Returns `false` when the user was already a member.
    async fn insert_membership(
        &self,
        membership: &OrgMembership,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError>;

    async fn delete_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError>;

    async fn find_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<OrgMembership>, ServiceError>;

    async fn memberships_for_user(&self, user_id: Uuid)
        -> Result<Vec<OrgMembership>, ServiceError>;
}

/// Refresh-token rows are owned and mutated only through this trait.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Open a family with its first active token.
    async fn insert_family(
        &self,
        family: &RefreshFamily,
        first: &RefreshToken,
        events: &[DomainEvent],
    ) -> Result<(), ServiceError>;

    /// Lookup by SHA-256 of the opaque value. Family revocation is folded
    /// into the returned row's `revoked_utc`.
    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError>;

    /// Single atomic step: mark `token_id` used if it is still unused,
    /// unrevoked, unexpired and its family is alive, and insert `successor`.
    /// Returns `false` without writing anything when the condition fails.
    async fn rotate_refresh_token(
        &self,
        token_id: Uuid,
        successor: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    /// Revoke the family and every token in it. Returns `false` when it was
    /// already revoked. `events` are recorded either way.
    async fn revoke_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError>;

    async fn find_family_tokens(&self, family_id: Uuid)
        -> Result<Vec<RefreshToken>, ServiceError>;
}

/// Events recorded with their mutations and not yet accepted by the bus.
///
/// Recording an event whose id is already pending is a no-op.
#[async_trait]
pub trait EventOutbox: Send + Sync {
    /// Lease up to `limit` unclaimed events, oldest first. Leased events are
    /// invisible to other claimers until released, completed, or `lease`
    /// elapses.
    async fn claim_events(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DomainEvent>, ServiceError>;

    /// Drop events the bus has accepted.
    async fn complete_events(&self, event_ids: &[Uuid]) -> Result<(), ServiceError>;

    /// Hand leased events back for the next claimer.
    async fn release_events(&self, event_ids: &[Uuid]) -> Result<(), ServiceError>;
}

/// Liveness check for backing infrastructure.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn component(&self) -> &'static str;
    async fn health_check(&self) -> Result<(), ServiceError>;
}

/// Bound `fut` by `limit`; elapsing surfaces as `Unavailable` for `component`.
pub async fn bounded<T, F>(component: &'static str, limit: Duration, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(component, timeout_ms = limit.as_millis() as u64, "Operation timed out");
            Err(ServiceError::unavailable(component, "operation timed out"))
        }
    }
}
