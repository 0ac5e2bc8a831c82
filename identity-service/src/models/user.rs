//! User model - one row per external identity that has ever signed in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Identity provider codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentProvider {
    Google,
}

impl IdentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentProvider::Google => "google",
        }
    }
}

impl std::str::FromStr for IdentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" => Ok(IdentProvider::Google),
            _ => Err(format!("Invalid identity provider: {}", s)),
        }
    }
}

impl std::fmt::Display for IdentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity verified by the OAuth provider. Trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub provider: IdentProvider,
    pub subject: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// User entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct User {
    pub user_id: Uuid,
    pub ident_provider_code: String,
    pub ident_subject: String,
    pub email: String,
    pub display_name: Option<String>,
    pub picture_url: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub last_login_utc: DateTime<Utc>,
}

impl User {
    /// Build the row for a first sign-in.
    pub fn from_identity(identity: &ExternalIdentity) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            ident_provider_code: identity.provider.as_str().to_string(),
            ident_subject: identity.subject.clone(),
            email: normalize_email(&identity.email),
            display_name: identity.name.clone(),
            picture_url: identity.picture.clone(),
            created_utc: now,
            last_login_utc: now,
        }
    }

    /// Whether this row belongs to the given external identity.
    pub fn matches_identity(&self, identity: &ExternalIdentity) -> bool {
        self.ident_provider_code == identity.provider.as_str()
            && self.ident_subject == identity.subject
    }
}

/// Emails compare case-insensitively; store them lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
