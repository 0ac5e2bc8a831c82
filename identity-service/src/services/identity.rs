use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::store::UserStore;
use super::ServiceError;
use crate::models::{DomainEvent, ExternalIdentity, Role, User};

/// Result of resolving a verified identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub user: User,
    /// This call inserted the row.
    pub created: bool,
}

/// Sole write path for user creation.
pub struct IdentityResolver {
    users: Arc<dyn UserStore>,
}

impl IdentityResolver {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Map an external identity to its user, creating it on first sign-in.
    ///
    /// An email already owned by a different identity is an `EmailConflict`;
    /// accounts are never merged. Concurrent first logins for one identity
    /// converge on a single row: the loser of the insert re-reads the winner.
    ///
    /// A created user starts with `initial_roles`. The row, the grants and
    /// their `user.created`/`role.assigned` events commit together.
    #[tracing::instrument(skip_all, fields(provider = %identity.provider))]
    pub async fn resolve_or_create(
        &self,
        identity: &ExternalIdentity,
        initial_roles: &[Role],
    ) -> Result<ResolvedUser, ServiceError> {
        if let Some(user) = self.touch_existing(identity).await? {
            return Ok(ResolvedUser {
                user,
                created: false,
            });
        }

        if let Some(owner) = self.users.find_user_by_email(&identity.email).await? {
            if !owner.matches_identity(identity) {
                tracing::warn!(user_id = %owner.user_id, "Email already bound to another identity");
                return Err(ServiceError::EmailConflict);
            }
        }

        let candidate = User::from_identity(identity);
        let role_ids: Vec<_> = initial_roles.iter().map(|r| r.role_id).collect();
        let mut events = vec![DomainEvent::user_created(&candidate)];
        events.extend(initial_roles.iter().map(|role| {
            DomainEvent::role_assigned(candidate.user_id, role, Uuid::nil(), candidate.user_id)
        }));

        if self
            .users
            .insert_user_if_absent(&candidate, &role_ids, &events)
            .await?
        {
            tracing::info!(user_id = %candidate.user_id, "Created user on first sign-in");
            return Ok(ResolvedUser {
                user: candidate,
                created: true,
            });
        }

        // Lost a race: either the same identity was just inserted, or its email
        // was claimed by someone else.
        match self.touch_existing(identity).await? {
            Some(user) => Ok(ResolvedUser {
                user,
                created: false,
            }),
            None => {
                tracing::warn!("Email claimed concurrently by another identity");
                Err(ServiceError::EmailConflict)
            }
        }
    }

    async fn touch_existing(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<Option<User>, ServiceError> {
        let Some(user) = self
            .users
            .find_user_by_identity(identity.provider, &identity.subject)
            .await?
        else {
            return Ok(None);
        };

        let user = self
            .users
            .record_login(
                user.user_id,
                identity.name.as_deref(),
                identity.picture.as_deref(),
                Utc::now(),
            )
            .await?;
        Ok(Some(user))
    }
}
