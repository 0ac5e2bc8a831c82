//! Token lifecycle.
//!
//! Two tiers with separate verification paths: access tokens are stateless
//! JWTs checked by signature and expiry only; refresh tokens are opaque,
//! persisted, and move through a per-family state machine:
//!
//! ```text
//! active --refresh--> used
//!   |                  |
//!   +--logout/reuse--> revoked (whole family, including later successors)
//! ```
//!
//! Presenting a token that is already used or revoked is treated as theft and
//! kills the family.

use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use super::jwt::{AccessTokenClaims, JwtService};
use super::store::RefreshTokenStore;
use super::ServiceError;
use crate::models::{DomainEvent, RefreshFamily, RefreshToken, RefreshTokenState};

/// Freshly issued credentials.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub family_id: Uuid,
}

/// Outcome of presenting a refresh token.
#[derive(Debug, Clone)]
pub enum RotationOutcome {
    Rotated {
        user_id: Uuid,
        family_id: Uuid,
        access_token: String,
        refresh_token: String,
    },
    /// The token had already been rotated or revoked. The family is now
    /// revoked; `token_id` is the replayed token.
    ReuseDetected {
        user_id: Uuid,
        family_id: Uuid,
        token_id: Uuid,
    },
}

pub struct TokenService {
    jwt: JwtService,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    refresh_lifetime: Duration,
}

impl TokenService {
    pub fn new(
        jwt: JwtService,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        refresh_token_expiry_days: i64,
    ) -> Self {
        Self {
            jwt,
            refresh_tokens,
            refresh_lifetime: Duration::days(refresh_token_expiry_days),
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    /// Open a new family with one active refresh token and sign an access
    /// token carrying `roles`. `events_for` receives the new family id; its
    /// events are committed with the family.
    pub async fn issue_session<F>(
        &self,
        user_id: Uuid,
        roles: &[String],
        events_for: F,
    ) -> Result<TokenPair, ServiceError>
    where
        F: FnOnce(Uuid) -> Vec<DomainEvent>,
    {
        let access_token = self.jwt.generate_access_token(user_id, roles)?;

        let family = RefreshFamily::new(user_id);
        let (first, refresh_token) =
            RefreshToken::issue(family.family_id, user_id, self.refresh_lifetime);
        let events = events_for(family.family_id);
        self.refresh_tokens
            .insert_family(&family, &first, &events)
            .await?;

        tracing::info!(%user_id, family_id = %family.family_id, "Issued session");
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.jwt.access_token_expiry_seconds(),
            family_id: family.family_id,
        })
    }

    /// Pure signature and expiry check; never touches the store.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        self.jwt.validate_access_token(token)
    }

    /// Exchange a refresh token for its successor and a new access token
    /// signed with the roles `roles_for` returns.
    ///
    /// Everything fallible happens before the token is marked used, so an
    /// error leaves it active and the caller may retry with it. Exactly one
    /// of any set of concurrent callers presenting the same active token
    /// wins; the others see it as used and trigger reuse handling.
    pub async fn rotate<F, Fut>(
        &self,
        refresh_token: &str,
        roles_for: F,
    ) -> Result<RotationOutcome, ServiceError>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<Vec<String>, ServiceError>>,
    {
        let token = self.lookup(refresh_token).await?;

        match token.state() {
            RefreshTokenState::Used | RefreshTokenState::Revoked => {
                return self.revoke_for_reuse(&token).await;
            }
            RefreshTokenState::Active if token.is_expired() => {
                return Err(ServiceError::Expired);
            }
            RefreshTokenState::Active => {}
        }

        let roles = roles_for(token.user_id).await?;
        let access_token = self.jwt.generate_access_token(token.user_id, &roles)?;
        let (successor, successor_value) =
            RefreshToken::issue(token.family_id, token.user_id, self.refresh_lifetime);

        if self
            .refresh_tokens
            .rotate_refresh_token(token.token_id, &successor, Utc::now())
            .await?
        {
            tracing::debug!(user_id = %token.user_id, family_id = %token.family_id, "Rotated refresh token");
            return Ok(RotationOutcome::Rotated {
                user_id: token.user_id,
                family_id: token.family_id,
                access_token,
                refresh_token: successor_value,
            });
        }

        // The conditional update matched nothing: someone else used or
        // revoked it between our read and write, or it just expired.
        let current = self.lookup(refresh_token).await?;
        if current.state() == RefreshTokenState::Active && current.is_expired() {
            return Err(ServiceError::Expired);
        }
        self.revoke_for_reuse(&current).await
    }

    /// Revoke the family `refresh_token` belongs to. Revoking an already
    /// revoked family succeeds.
    pub async fn revoke(&self, refresh_token: &str) -> Result<Uuid, ServiceError> {
        let token = self.lookup(refresh_token).await?;
        if self
            .refresh_tokens
            .revoke_family(token.family_id, Utc::now(), &[])
            .await?
        {
            tracing::info!(user_id = %token.user_id, family_id = %token.family_id, "Session revoked");
        }
        Ok(token.family_id)
    }

    async fn lookup(&self, refresh_token: &str) -> Result<RefreshToken, ServiceError> {
        self.refresh_tokens
            .find_refresh_token_by_hash(&RefreshToken::hash_token(refresh_token))
            .await?
            .ok_or(ServiceError::NotFound("Refresh token"))
    }

    /// Revoke the family and record `token.reuse_detected` with it.
    async fn revoke_for_reuse(&self, token: &RefreshToken) -> Result<RotationOutcome, ServiceError> {
        let event =
            DomainEvent::token_reuse_detected(token.user_id, token.family_id, token.token_id);
        self.refresh_tokens
            .revoke_family(token.family_id, Utc::now(), &[event])
            .await?;
        tracing::warn!(
            user_id = %token.user_id,
            family_id = %token.family_id,
            token_id = %token.token_id,
            "Refresh token reuse detected; family revoked"
        );
        Ok(RotationOutcome::ReuseDetected {
            user_id: token.user_id,
            family_id: token.family_id,
            token_id: token.token_id,
        })
    }
}
