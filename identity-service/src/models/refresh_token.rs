use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle position of one refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshTokenState {
    /// Unused and presentable exactly once.
    Active,
    /// Already exchanged for a successor.
    Used,
    /// Killed by logout, explicit revocation or reuse detection.
    Revoked,
}

/// Rotation lineage started by one login.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshFamily {
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl RefreshFamily {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            family_id: Uuid::new_v4(),
            user_id,
            created_utc: Utc::now(),
            revoked_utc: None,
        }
    }
}

/// Refresh token row. Only the SHA-256 of the opaque value is stored.
///
/// `revoked_utc` as read from the store already folds in the family's
/// revocation, so a successor minted after its family died reads as revoked.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshToken {
    pub token_id: Uuid,
    pub family_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl RefreshToken {
    /// Mint a new active token in `family_id`. Returns the row and the opaque
    /// value handed to the client.
    pub fn issue(family_id: Uuid, user_id: Uuid, lifetime: Duration) -> (Self, String) {
        let token = generate_opaque_token();
        let now = Utc::now();
        let row = Self {
            token_id: Uuid::new_v4(),
            family_id,
            user_id,
            token_hash: Self::hash_token(&token),
            issued_utc: now,
            expiry_utc: now + lifetime,
            used_utc: None,
            revoked_utc: None,
        };
        (row, token)
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn state(&self) -> RefreshTokenState {
        if self.revoked_utc.is_some() {
            RefreshTokenState::Revoked
        } else if self.used_utc.is_some() {
            RefreshTokenState::Used
        } else {
            RefreshTokenState::Active
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
