//! In-process implementation of the identity stores.
//!
//! One mutex guards all tables so each trait call is atomic, which gives the
//! same guarantees the PostgreSQL store gets from transactions. Events passed
//! to a mutation land in the outbox under the same lock. Used by tests and
//! local runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::store::{
    AccessStore, EventOutbox, HealthCheck, RefreshTokenStore, RoleDeletion, UserStore,
};
use super::ServiceError;
use crate::models::{
    normalize_email, DomainEvent, IdentProvider, OrgMembership, Organization, OrganizationChanges,
    RefreshFamily, RefreshToken, Role, RoleChanges, User, UserRole,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    user_roles: Vec<UserRole>,
    organizations: HashMap<Uuid, Organization>,
    memberships: Vec<OrgMembership>,
    families: HashMap<Uuid, RefreshFamily>,
    tokens: HashMap<Uuid, RefreshToken>,
    outbox: Vec<OutboxEntry>,
}

struct OutboxEntry {
    event: DomainEvent,
    claimed_until: Option<DateTime<Utc>>,
}

impl Tables {
    fn record(&mut self, events: &[DomainEvent]) {
        for event in events {
            if !self.outbox.iter().any(|e| e.event.event_id == event.event_id) {
                self.outbox.push(OutboxEntry {
                    event: event.clone(),
                    claimed_until: None,
                });
            }
        }
    }

    /// Token as the store reports it, with family revocation folded in.
    fn read_token(&self, token: &RefreshToken) -> RefreshToken {
        let mut token = token.clone();
        if token.revoked_utc.is_none() {
            token.revoked_utc = self
                .families
                .get(&token.family_id)
                .and_then(|f| f.revoked_utc);
        }
        token
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_role_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` role lookups fail as unavailable.
    pub fn fail_role_reads(&self, count: usize) {
        self.failing_role_reads.store(count, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, ServiceError> {
        self.tables
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store mutex poisoned: {}", e).into())
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    fn component(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.tables().map(|_| ())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.tables()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_identity(
        &self,
        provider: IdentProvider,
        subject: &str,
    ) -> Result<Option<User>, ServiceError> {
        Ok(self
            .tables()?
            .users
            .values()
            .find(|u| u.ident_provider_code == provider.as_str() && u.ident_subject == subject)
            .cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let email = normalize_email(email);
        Ok(self
            .tables()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn insert_user_if_absent(
        &self,
        user: &User,
        role_ids: &[Uuid],
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if role_ids.iter().any(|id| !tables.roles.contains_key(id)) {
            return Err(ServiceError::Conflict(
                "user_roles references a missing role".to_string(),
            ));
        }
        let taken = tables.users.values().any(|u| {
            u.user_id == user.user_id
                || u.email == user.email
                || (u.ident_provider_code == user.ident_provider_code
                    && u.ident_subject == user.ident_subject)
        });
        if taken {
            return Ok(false);
        }
        tables.users.insert(user.user_id, user.clone());
        for role_id in role_ids {
            tables.user_roles.push(UserRole {
                user_id: user.user_id,
                role_id: *role_id,
                assigned_utc: user.created_utc,
            });
        }
        tables.record(events);
        Ok(true)
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
        picture_url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<User, ServiceError> {
        let mut tables = self.tables()?;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(ServiceError::NotFound("User"))?;
        user.last_login_utc = at;
        if let Some(name) = display_name {
            user.display_name = Some(name.to_string());
        }
        if let Some(picture) = picture_url {
            user.picture_url = Some(picture.to_string());
        }
        Ok(user.clone())
    }

    async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, ServiceError> {
        let tables = self.tables()?;
        let mut users: Vec<User> = tables.users.values().cloned().collect();
        users.sort_by_key(|u| (u.created_utc, u.user_id));
        Ok(users
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl AccessStore for MemoryStore {
    async fn list_roles(&self) -> Result<Vec<Role>, ServiceError> {
        let mut roles: Vec<Role> = self.tables()?.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.role_name.cmp(&b.role_name));
        Ok(roles)
    }

    async fn find_role_by_id(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        Ok(self.tables()?.roles.get(&role_id).cloned())
    }

    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError> {
        let mut tables = self.tables()?;
        if tables.roles.values().any(|r| r.role_name == role.role_name) {
            return Err(ServiceError::Conflict(format!(
                "Role '{}' already exists",
                role.role_name
            )));
        }
        tables.roles.insert(role.role_id, role.clone());
        Ok(())
    }

    async fn ensure_role(&self, role: &Role) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if tables.roles.values().any(|r| r.role_name == role.role_name) {
            return Ok(false);
        }
        tables.roles.insert(role.role_id, role.clone());
        Ok(true)
    }

    async fn update_role(
        &self,
        role_id: Uuid,
        changes: &RoleChanges,
    ) -> Result<Option<Role>, ServiceError> {
        let mut tables = self.tables()?;
        if let Some(name) = &changes.role_name {
            if tables
                .roles
                .values()
                .any(|r| r.role_id != role_id && &r.role_name == name)
            {
                return Err(ServiceError::Conflict(format!("Role '{}' already exists", name)));
            }
        }
        let Some(role) = tables.roles.get_mut(&role_id) else {
            return Ok(None);
        };
        if let Some(name) = &changes.role_name {
            role.role_name = name.clone();
        }
        if let Some(description) = &changes.description {
            role.description = Some(description.clone());
        }
        Ok(Some(role.clone()))
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<RoleDeletion, ServiceError> {
        let mut tables = self.tables()?;
        let holders = tables
            .user_roles
            .iter()
            .filter(|ur| ur.role_id == role_id)
            .count() as i64;
        if holders > 0 {
            return Ok(RoleDeletion::InUse(holders));
        }
        Ok(match tables.roles.remove(&role_id) {
            Some(_) => RoleDeletion::Deleted,
            None => RoleDeletion::NotFound,
        })
    }

    async fn role_names_for_user(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError> {
        if self
            .failing_role_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServiceError::unavailable("store", "injected role read failure"));
        }
        let tables = self.tables()?;
        let mut names: Vec<String> = tables
            .user_roles
            .iter()
            .filter(|ur| ur.user_id == user_id)
            .filter_map(|ur| tables.roles.get(&ur.role_id))
            .map(|r| r.role_name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn insert_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if !tables.users.contains_key(&user_id) || !tables.roles.contains_key(&role_id) {
            return Err(ServiceError::Conflict(
                "user_roles references a missing user or role".to_string(),
            ));
        }
        if tables
            .user_roles
            .iter()
            .any(|ur| ur.user_id == user_id && ur.role_id == role_id)
        {
            return Ok(false);
        }
        tables.user_roles.push(UserRole {
            user_id,
            role_id,
            assigned_utc: Utc::now(),
        });
        tables.record(events);
        Ok(true)
    }

    async fn delete_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        let before = tables.user_roles.len();
        tables
            .user_roles
            .retain(|ur| !(ur.user_id == user_id && ur.role_id == role_id));
        let removed = tables.user_roles.len() != before;
        if removed {
            tables.record(events);
        }
        Ok(removed)
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, ServiceError> {
        let mut orgs: Vec<Organization> =
            self.tables()?.organizations.values().cloned().collect();
        orgs.sort_by(|a, b| a.org_name.cmp(&b.org_name));
        Ok(orgs)
    }

    async fn find_organization_by_id(
        &self,
        org_id: Uuid,
    ) -> Result<Option<Organization>, ServiceError> {
        Ok(self.tables()?.organizations.get(&org_id).cloned())
    }

    async fn insert_organization(&self, org: &Organization) -> Result<(), ServiceError> {
        let mut tables = self.tables()?;
        if tables
            .organizations
            .values()
            .any(|o| o.org_name == org.org_name)
        {
            return Err(ServiceError::Conflict(format!(
                "Organization '{}' already exists",
                org.org_name
            )));
        }
        tables.organizations.insert(org.org_id, org.clone());
        Ok(())
    }

    async fn update_organization(
        &self,
        org_id: Uuid,
        changes: &OrganizationChanges,
    ) -> Result<Option<Organization>, ServiceError> {
        let mut tables = self.tables()?;
        if let Some(name) = &changes.org_name {
            if tables
                .organizations
                .values()
                .any(|o| o.org_id != org_id && &o.org_name == name)
            {
                return Err(ServiceError::Conflict(format!(
                    "Organization '{}' already exists",
                    name
                )));
            }
        }
        let Some(org) = tables.organizations.get_mut(&org_id) else {
            return Ok(None);
        };
        if let Some(name) = &changes.org_name {
            org.org_name = name.clone();
        }
        if let Some(description) = &changes.description {
            org.description = Some(description.clone());
        }
        if let Some(metadata) = &changes.metadata {
            org.metadata = metadata.clone();
        }
        org.updated_utc = Utc::now();
        Ok(Some(org.clone()))
    }

    async fn delete_organization(&self, org_id: Uuid) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if tables.organizations.remove(&org_id).is_none() {
            return Ok(false);
        }
        tables.memberships.retain(|m| m.org_id != org_id);
        Ok(true)
    }

    async fn insert_membership(
        &self,
        membership: &OrgMembership,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        if !tables.users.contains_key(&membership.user_id)
            || !tables.organizations.contains_key(&membership.org_id)
        {
            return Err(ServiceError::Conflict(
                "user_organizations references a missing user or organization".to_string(),
            ));
        }
        if tables
            .memberships
            .iter()
            .any(|m| m.user_id == membership.user_id && m.org_id == membership.org_id)
        {
            return Ok(false);
        }
        tables.memberships.push(membership.clone());
        tables.record(events);
        Ok(true)
    }

    async fn delete_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        let before = tables.memberships.len();
        tables
            .memberships
            .retain(|m| !(m.user_id == user_id && m.org_id == org_id));
        let removed = tables.memberships.len() != before;
        if removed {
            tables.record(events);
        }
        Ok(removed)
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<OrgMembership>, ServiceError> {
        Ok(self
            .tables()?
            .memberships
            .iter()
            .find(|m| m.user_id == user_id && m.org_id == org_id)
            .cloned())
    }

    async fn memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<OrgMembership>, ServiceError> {
        Ok(self
            .tables()?
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert_family(
        &self,
        family: &RefreshFamily,
        first: &RefreshToken,
        events: &[DomainEvent],
    ) -> Result<(), ServiceError> {
        let mut tables = self.tables()?;
        if tables.families.contains_key(&family.family_id)
            || tables.tokens.values().any(|t| t.token_hash == first.token_hash)
        {
            return Err(ServiceError::Conflict("refresh token already exists".to_string()));
        }
        tables.families.insert(family.family_id, family.clone());
        tables.tokens.insert(first.token_id, first.clone());
        tables.record(events);
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        let tables = self.tables()?;
        Ok(tables
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .map(|t| tables.read_token(t)))
    }

    async fn rotate_refresh_token(
        &self,
        token_id: Uuid,
        successor: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        let claimable = match tables.tokens.get(&token_id) {
            Some(token) => {
                let family_alive = tables
                    .families
                    .get(&token.family_id)
                    .is_some_and(|f| f.revoked_utc.is_none());
                family_alive
                    && token.used_utc.is_none()
                    && token.revoked_utc.is_none()
                    && !token.is_expired_at(now)
            }
            None => false,
        };
        if !claimable {
            return Ok(false);
        }
        if let Some(token) = tables.tokens.get_mut(&token_id) {
            token.used_utc = Some(now);
        }
        tables.tokens.insert(successor.token_id, successor.clone());
        Ok(true)
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.tables()?;
        let newly_revoked = match tables.families.get_mut(&family_id) {
            Some(family) if family.revoked_utc.is_none() => {
                family.revoked_utc = Some(now);
                true
            }
            _ => false,
        };
        for token in tables.tokens.values_mut() {
            if token.family_id == family_id && token.revoked_utc.is_none() {
                token.revoked_utc = Some(now);
            }
        }
        tables.record(events);
        Ok(newly_revoked)
    }

    async fn find_family_tokens(
        &self,
        family_id: Uuid,
    ) -> Result<Vec<RefreshToken>, ServiceError> {
        let tables = self.tables()?;
        let mut tokens: Vec<RefreshToken> = tables
            .tokens
            .values()
            .filter(|t| t.family_id == family_id)
            .map(|t| tables.read_token(t))
            .collect();
        tokens.sort_by_key(|t| t.issued_utc);
        Ok(tokens)
    }
}

#[async_trait]
impl EventOutbox for MemoryStore {
    async fn claim_events(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DomainEvent>, ServiceError> {
        let now = Utc::now();
        let until = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
        let mut tables = self.tables()?;
        Ok(tables
            .outbox
            .iter_mut()
            .filter(|e| e.claimed_until.map_or(true, |t| t <= now))
            .take(limit)
            .map(|e| {
                e.claimed_until = Some(until);
                e.event.clone()
            })
            .collect())
    }

    async fn complete_events(&self, event_ids: &[Uuid]) -> Result<(), ServiceError> {
        self.tables()?
            .outbox
            .retain(|e| !event_ids.contains(&e.event.event_id));
        Ok(())
    }

    async fn release_events(&self, event_ids: &[Uuid]) -> Result<(), ServiceError> {
        for entry in self.tables()?.outbox.iter_mut() {
            if event_ids.contains(&entry.event.event_id) {
                entry.claimed_until = None;
            }
        }
        Ok(())
    }
}
