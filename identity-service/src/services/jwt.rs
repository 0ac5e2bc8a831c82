use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fs;
use uuid::Uuid;

use super::ServiceError;
use crate::config::JwtConfig;

/// JWT service for access token signing and verification.
///
/// Access tokens are stateless: verification is signature plus claims, with
/// no store lookup.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_minutes: i64,
    issuer: String,
}

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Role names held when the token was minted
    pub roles: Vec<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// JWT ID
    pub jti: String,
    pub iss: String,
}

impl AccessTokenClaims {
    pub fn user_id(&self) -> Result<Uuid, ServiceError> {
        Uuid::parse_str(&self.sub).map_err(|_| ServiceError::Invalid)
    }
}

impl JwtService {
    /// Create a new JWT service by loading RSA keys from files
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;

        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        Self::from_rsa_pem(
            private_key_pem.as_bytes(),
            public_key_pem.as_bytes(),
            config.access_token_expiry_minutes,
            &config.issuer,
        )
    }

    pub fn from_rsa_pem(
        private_key_pem: &[u8],
        public_key_pem: &[u8],
        access_token_expiry_minutes: i64,
        issuer: &str,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        tracing::info!("JWT service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            access_token_expiry_minutes,
            issuer: issuer.to_string(),
        })
    }

    /// Generate an access token for a user
    pub fn generate_access_token(
        &self,
        user_id: Uuid,
        roles: &[String],
    ) -> Result<String, ServiceError> {
        self.generate_access_token_at(user_id, roles, Utc::now())
    }

    /// Generate an access token as if minted at `issued_at`.
    pub fn generate_access_token_at(
        &self,
        user_id: Uuid,
        roles: &[String],
        issued_at: DateTime<Utc>,
    ) -> Result<String, ServiceError> {
        let exp = issued_at + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            roles: roles.to_vec(),
            exp: exp.timestamp(),
            iat: issued_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
        };

        let header = Header::new(Algorithm::RS256);
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e).into())
    }

    /// Validate and decode an access token.
    ///
    /// Expiry surfaces as `Expired`; anything else wrong with the token is
    /// `Invalid`.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ServiceError::Expired,
                _ => {
                    tracing::debug!("Access token rejected: {}", e);
                    ServiceError::Invalid
                }
            })
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/jwt_private.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/jwt_public.pem");

    fn service() -> JwtService {
        JwtService::from_rsa_pem(
            PRIVATE_KEY.as_bytes(),
            PUBLIC_KEY.as_bytes(),
            15,
            "identity-service",
        )
        .unwrap()
    }

    #[test]
    fn test_access_token_generation_and_validation() {
        let service = service();
        let user_id = Uuid::new_v4();
        let roles = vec!["admin".to_string(), "reader".to_string()];

        let token = service.generate_access_token(user_id, &roles).unwrap();
        let claims = service.validate_access_token(&token).unwrap();

        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.roles, roles);
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert_eq!(claims.iss, "identity-service");
    }

    #[test]
    fn test_expired_token_is_reported_as_expired() {
        let service = service();
        let token = service
            .generate_access_token_at(Uuid::new_v4(), &[], Utc::now() - Duration::hours(1))
            .unwrap();

        assert!(matches!(
            service.validate_access_token(&token),
            Err(ServiceError::Expired)
        ));
    }

    #[test]
    fn test_tampered_token_is_invalid() {
        let service = service();
        let token = service.generate_access_token(Uuid::new_v4(), &[]).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');

        assert!(matches!(
            service.validate_access_token(&tampered),
            Err(ServiceError::Invalid)
        ));
        assert!(matches!(
            service.validate_access_token("not-a-jwt"),
            Err(ServiceError::Invalid)
        ));
    }

    #[test]
    fn test_foreign_issuer_is_invalid() {
        let ours = service();
        let theirs =
            JwtService::from_rsa_pem(PRIVATE_KEY.as_bytes(), PUBLIC_KEY.as_bytes(), 15, "other")
                .unwrap();
        let token = theirs.generate_access_token(Uuid::new_v4(), &[]).unwrap();

        assert!(matches!(
            ours.validate_access_token(&token),
            Err(ServiceError::Invalid)
        ));
    }
}
