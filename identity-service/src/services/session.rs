//! Session facade: login, refresh, current user, logout and the admin-gated
//! role/organization operations, composed from the identity components.
//!
//! Each mutation commits its events to the outbox with it, then the facade
//! relays the outbox to the bus. A relay failure is reported as `Unavailable`
//! but never undoes the mutation; the events stay pending and go out with the
//! next relay, including the one a retried call runs when it finds nothing
//! left to change.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::events::{EventBus, EventPublisher};
use super::identity::IdentityResolver;
use super::jwt::{AccessTokenClaims, JwtService};
use super::metrics;
use super::oauth::{CredentialVerifier, IdentityProvider, LoginRedirect, OAuthStateStore};
use super::rbac::{Decision, RbacAuthorizer};
use super::store::{AccessStore, EventOutbox, RefreshTokenStore, RoleDeletion, UserStore};
use super::tokens::{RotationOutcome, TokenService};
use super::ServiceError;
use crate::models::{
    normalize_email, DomainEvent, OrgMembership, Organization, OrganizationChanges, Role,
    RoleChanges, User, ADMIN_ROLE,
};

/// Default label for organization memberships created without one.
pub const DEFAULT_MEMBERSHIP_LABEL: &str = "member";

/// External collaborators the facade runs against.
#[derive(Clone)]
pub struct Backends {
    pub users: Arc<dyn UserStore>,
    pub access: Arc<dyn AccessStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub states: Arc<dyn OAuthStateStore>,
    pub provider: Arc<dyn IdentityProvider>,
    pub bus: Arc<dyn EventBus>,
    pub outbox: Arc<dyn EventOutbox>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub state_ttl_seconds: u64,
    pub refresh_token_expiry_days: i64,
    /// Upper bound on each bus publish.
    pub operation_timeout: Duration,
    /// Users created with one of these emails start with the admin role.
    pub bootstrap_admin_emails: Vec<String>,
}

/// Who is performing an admin operation, and which operation this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    /// Causal id for events. Retries of one request must reuse it.
    pub operation_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub is_new_user: bool,
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Whether an assignment call changed anything. Repeats are no-ops and
/// record no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentOutcome {
    Applied,
    Unchanged,
}

pub struct SessionFacade {
    verifier: CredentialVerifier,
    resolver: IdentityResolver,
    rbac: RbacAuthorizer,
    tokens: TokenService,
    publisher: EventPublisher,
    users: Arc<dyn UserStore>,
    access: Arc<dyn AccessStore>,
    bootstrap_admins: HashSet<String>,
}

impl SessionFacade {
    pub fn new(backends: Backends, jwt: JwtService, settings: SessionSettings) -> Self {
        Self {
            verifier: CredentialVerifier::new(
                backends.provider,
                backends.states,
                settings.state_ttl_seconds,
            ),
            resolver: IdentityResolver::new(backends.users.clone()),
            rbac: RbacAuthorizer::new(backends.access.clone()),
            tokens: TokenService::new(
                jwt,
                backends.refresh_tokens,
                settings.refresh_token_expiry_days,
            ),
            publisher: EventPublisher::new(
                backends.bus,
                backends.outbox,
                settings.operation_timeout,
            ),
            users: backends.users,
            access: backends.access,
            bootstrap_admins: settings
                .bootstrap_admin_emails
                .iter()
                .map(|e| normalize_email(e))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn rbac(&self) -> &RbacAuthorizer {
        &self.rbac
    }

    // ==================== Login & Session ====================

    pub async fn begin_login(&self) -> Result<LoginRedirect, ServiceError> {
        self.verifier.begin().await
    }

    #[tracing::instrument(skip_all)]
    pub async fn complete_login(&self, code: &str, state: &str) -> Result<LoginResult, ServiceError> {
        let result = self.login(code, state).await;
        match &result {
            Ok(login) => {
                metrics::record_login(if login.is_new_user { "created" } else { "success" })
            }
            Err(e) => metrics::record_login(login_outcome(e)),
        }
        result
    }

    async fn login(&self, code: &str, state: &str) -> Result<LoginResult, ServiceError> {
        let identity = self.verifier.exchange_code(code, state).await?;
        let initial_roles = self.initial_roles_for(&identity.email).await?;
        let resolved = self
            .resolver
            .resolve_or_create(&identity, &initial_roles)
            .await?;
        let user = resolved.user;

        let roles = self.access.role_names_for_user(user.user_id).await?;
        let pair = self
            .tokens
            .issue_session(user.user_id, &roles, |family_id| {
                vec![DomainEvent::user_logged_in(&user, family_id)]
            })
            .await?;

        if let Err(e) = self.publisher.relay().await {
            // The caller never sees these tokens, so the session must not
            // outlive the failed call.
            if let Err(revoke) = self.tokens.revoke(&pair.refresh_token).await {
                tracing::error!(
                    user_id = %user.user_id,
                    family_id = %pair.family_id,
                    error = %revoke,
                    "Could not revoke session after failed login"
                );
            }
            return Err(e);
        }

        tracing::info!(user_id = %user.user_id, is_new_user = resolved.created, "User logged in");
        Ok(LoginResult {
            user,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_in: pair.expires_in,
            is_new_user: resolved.created,
        })
    }

    /// Roles a user created with `email` starts with.
    async fn initial_roles_for(&self, email: &str) -> Result<Vec<Role>, ServiceError> {
        if !self.bootstrap_admins.contains(&normalize_email(email)) {
            return Ok(vec![]);
        }
        match self.find_role_by_name(ADMIN_ROLE).await? {
            Some(admin) => Ok(vec![admin]),
            None => {
                tracing::warn!("Bootstrap admin email matched but admin role is not seeded");
                Ok(vec![])
            }
        }
    }

    /// Rotate the refresh token and mint a new access token from the user's
    /// current roles.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResult, ServiceError> {
        let rotation = self
            .tokens
            .rotate(refresh_token, |user_id| self.access.role_names_for_user(user_id))
            .await;
        let outcome = match rotation {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::record_refresh(refresh_outcome(&e));
                return Err(e);
            }
        };

        match outcome {
            RotationOutcome::Rotated {
                access_token,
                refresh_token,
                ..
            } => {
                metrics::record_refresh("rotated");
                Ok(RefreshResult {
                    access_token,
                    refresh_token,
                    expires_in: self.tokens.jwt().access_token_expiry_seconds(),
                })
            }
            RotationOutcome::ReuseDetected { user_id, family_id, .. } => {
                metrics::record_refresh("reuse_detected");
                // The family is already revoked and the event is recorded; a
                // relay failure must not turn reuse into a retryable error.
                if let Err(e) = self.publisher.relay().await {
                    tracing::error!(%user_id, %family_id, error = %e, "Reuse event not relayed yet");
                }
                Err(ServiceError::ReuseDetected)
            }
        }
    }

    /// Resolve the bearer of a valid access token.
    pub async fn current_user(&self, access_token: &str) -> Result<User, ServiceError> {
        let claims = self.tokens.verify_access_token(access_token)?;
        self.users
            .find_user_by_id(claims.user_id()?)
            .await?
            .ok_or(ServiceError::NotFound("User"))
    }

    /// Stateless verification for request authentication.
    pub fn authenticate(&self, access_token: &str) -> Result<AccessTokenClaims, ServiceError> {
        self.tokens.verify_access_token(access_token)
    }

    pub async fn effective_permissions(
        &self,
        user_id: Uuid,
    ) -> Result<BTreeSet<String>, ServiceError> {
        self.rbac.effective_permissions(user_id).await
    }

    pub async fn memberships(&self, user_id: Uuid) -> Result<Vec<OrgMembership>, ServiceError> {
        self.access.memberships_for_user(user_id).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, refresh_token: &str) -> Result<(), ServiceError> {
        self.tokens.revoke(refresh_token).await.map(|_| ())
    }

    /// Live-state permission query, independent of the token's role snapshot.
    pub async fn check_access(
        &self,
        user_id: Uuid,
        required_role: &str,
        org_id: Option<Uuid>,
    ) -> Result<Decision, ServiceError> {
        match org_id {
            Some(org_id) => {
                self.rbac
                    .authorize_in_organization(user_id, org_id, required_role)
                    .await
            }
            None => self.rbac.authorize(user_id, required_role).await,
        }
    }

    // ==================== Assignments ====================

    #[tracing::instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn assign_role(
        &self,
        actor: Actor,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<AssignmentOutcome, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.require_user(user_id).await?;
        let role = self.require_role(role_id).await?;

        let event = DomainEvent::role_assigned(user_id, &role, actor.user_id, actor.operation_id);
        let outcome = if self.access.insert_user_role(user_id, role_id, &[event]).await? {
            tracing::info!(%user_id, role = %role.role_name, "Role assigned");
            AssignmentOutcome::Applied
        } else {
            AssignmentOutcome::Unchanged
        };
        self.relay_pending_events().await?;
        Ok(outcome)
    }

    #[tracing::instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn remove_role(
        &self,
        actor: Actor,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<AssignmentOutcome, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.require_user(user_id).await?;
        let role = self.require_role(role_id).await?;

        let event = DomainEvent::role_removed(user_id, &role, actor.user_id, actor.operation_id);
        let outcome = if self.access.delete_user_role(user_id, role_id, &[event]).await? {
            tracing::info!(%user_id, role = %role.role_name, "Role removed");
            AssignmentOutcome::Applied
        } else {
            AssignmentOutcome::Unchanged
        };
        self.relay_pending_events().await?;
        Ok(outcome)
    }

    #[tracing::instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn assign_organization(
        &self,
        actor: Actor,
        user_id: Uuid,
        org_id: Uuid,
        membership_label: Option<String>,
    ) -> Result<AssignmentOutcome, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.require_user(user_id).await?;
        let org = self.require_organization(org_id).await?;

        let label = membership_label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_MEMBERSHIP_LABEL.to_string());
        let membership = OrgMembership::new(user_id, org_id, label);

        let event =
            DomainEvent::organization_assigned(&membership, &org, actor.user_id, actor.operation_id);
        let outcome = if self.access.insert_membership(&membership, &[event]).await? {
            tracing::info!(%user_id, org = %org.org_name, "Organization assigned");
            AssignmentOutcome::Applied
        } else {
            AssignmentOutcome::Unchanged
        };
        self.relay_pending_events().await?;
        Ok(outcome)
    }

    #[tracing::instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn remove_organization(
        &self,
        actor: Actor,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<AssignmentOutcome, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.require_user(user_id).await?;
        let org = self.require_organization(org_id).await?;

        let event = DomainEvent::organization_removed(user_id, &org, actor.user_id, actor.operation_id);
        let outcome = if self.access.delete_membership(user_id, org_id, &[event]).await? {
            tracing::info!(%user_id, org = %org.org_name, "Organization removed");
            AssignmentOutcome::Applied
        } else {
            AssignmentOutcome::Unchanged
        };
        self.relay_pending_events().await?;
        Ok(outcome)
    }

    /// Push events left behind by earlier failed relays.
    pub async fn relay_pending_events(&self) -> Result<usize, ServiceError> {
        self.publisher.relay().await
    }

    // ==================== Catalogue ====================

    pub async fn list_users(
        &self,
        actor: Actor,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<User>, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.users.list_users(limit, offset).await
    }

    pub async fn list_roles(&self, actor: Actor) -> Result<Vec<Role>, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.access.list_roles().await
    }

    pub async fn create_role(
        &self,
        actor: Actor,
        role_name: &str,
        description: Option<String>,
    ) -> Result<Role, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        let role = Role::new(normalize_name(role_name)?, description);
        self.access.insert_role(&role).await?;
        tracing::info!(role_id = %role.role_id, role = %role.role_name, "Role created");
        Ok(role)
    }

    pub async fn update_role(
        &self,
        actor: Actor,
        role_id: Uuid,
        mut changes: RoleChanges,
    ) -> Result<Role, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        if let Some(name) = changes.role_name.take() {
            changes.role_name = Some(normalize_name(&name)?);
        }
        self.access
            .update_role(role_id, &changes)
            .await?
            .ok_or(ServiceError::NotFound("Role"))
    }

    /// Roles still held by users cannot be deleted.
    pub async fn delete_role(&self, actor: Actor, role_id: Uuid) -> Result<(), ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        match self.access.delete_role(role_id).await? {
            RoleDeletion::Deleted => {
                tracing::info!(%role_id, "Role deleted");
                Ok(())
            }
            RoleDeletion::NotFound => Err(ServiceError::NotFound("Role")),
            RoleDeletion::InUse(holders) => Err(ServiceError::Conflict(format!(
                "Role is assigned to {} user(s); remove the assignments first",
                holders
            ))),
        }
    }

    pub async fn list_organizations(&self, actor: Actor) -> Result<Vec<Organization>, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        self.access.list_organizations().await
    }

    pub async fn create_organization(
        &self,
        actor: Actor,
        org_name: &str,
        description: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Organization, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        let org = Organization::new(normalize_name(org_name)?, description, metadata);
        self.access.insert_organization(&org).await?;
        tracing::info!(org_id = %org.org_id, org = %org.org_name, "Organization created");
        Ok(org)
    }

    pub async fn update_organization(
        &self,
        actor: Actor,
        org_id: Uuid,
        mut changes: OrganizationChanges,
    ) -> Result<Organization, ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        if let Some(name) = changes.org_name.take() {
            changes.org_name = Some(normalize_name(&name)?);
        }
        self.access
            .update_organization(org_id, &changes)
            .await?
            .ok_or(ServiceError::NotFound("Organization"))
    }

    /// Memberships of the organization are deleted with it.
    pub async fn delete_organization(&self, actor: Actor, org_id: Uuid) -> Result<(), ServiceError> {
        self.rbac.require_admin(actor.user_id).await?;
        if !self.access.delete_organization(org_id).await? {
            return Err(ServiceError::NotFound("Organization"));
        }
        tracing::info!(%org_id, "Organization deleted");
        Ok(())
    }

    // ==================== Helpers ====================

    async fn require_user(&self, user_id: Uuid) -> Result<User, ServiceError> {
        self.users
            .find_user_by_id(user_id)
            .await?
            .ok_or(ServiceError::NotFound("User"))
    }

    async fn require_role(&self, role_id: Uuid) -> Result<Role, ServiceError> {
        self.access
            .find_role_by_id(role_id)
            .await?
            .ok_or(ServiceError::NotFound("Role"))
    }

    async fn require_organization(&self, org_id: Uuid) -> Result<Organization, ServiceError> {
        self.access
            .find_organization_by_id(org_id)
            .await?
            .ok_or(ServiceError::NotFound("Organization"))
    }

    async fn find_role_by_name(&self, role_name: &str) -> Result<Option<Role>, ServiceError> {
        Ok(self
            .access
            .list_roles()
            .await?
            .into_iter()
            .find(|r| r.role_name == role_name))
    }
}

impl Actor {
    pub fn new(user_id: Uuid, operation_id: Uuid) -> Self {
        Self {
            user_id,
            operation_id,
        }
    }

    /// Actor for a one-off call with no caller-supplied operation id.
    pub fn fresh(user_id: Uuid) -> Self {
        Self::new(user_id, Uuid::new_v4())
    }
}

fn normalize_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("Name must not be empty".to_string()));
    }
    Ok(name.to_string())
}

fn login_outcome(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::InvalidState => "invalid_state",
        ServiceError::InvalidGrant(_) => "invalid_grant",
        ServiceError::ProviderUnavailable(_) => "provider_unavailable",
        ServiceError::EmailConflict => "email_conflict",
        _ => "error",
    }
}

fn refresh_outcome(err: &ServiceError) -> &'static str {
    match err {
        ServiceError::Expired => "expired",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::Invalid => "invalid",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_required() {
        assert_eq!(normalize_name("  auditor ").unwrap(), "auditor");
        assert!(matches!(normalize_name("   "), Err(ServiceError::Validation(_))));
    }

    #[test]
    fn login_failures_have_distinct_outcomes() {
        assert_eq!(login_outcome(&ServiceError::InvalidState), "invalid_state");
        assert_eq!(
            login_outcome(&ServiceError::ProviderUnavailable("503".into())),
            "provider_unavailable"
        );
        assert_eq!(refresh_outcome(&ServiceError::Expired), "expired");
    }
}
