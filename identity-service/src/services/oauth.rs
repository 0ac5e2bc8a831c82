//! Credential verification: Google OAuth 2.0 authorization code flow with PKCE.
//!
//! `begin` issues a single-use anti-forgery `state` bound to a PKCE verifier;
//! `exchange_code` consumes it and trades the code for a verified identity.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::ServiceError;
use crate::config::GoogleOAuthConfig;
use crate::models::{ExternalIdentity, IdentProvider};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Outbound side of the login flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn provider(&self) -> IdentProvider;

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String;

    /// Trade an authorization code for the identity it was issued to.
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ExternalIdentity, ServiceError>;
}

/// Pending login attempts, keyed by `state`.
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    async fn save_state(
        &self,
        state: &str,
        code_verifier: &str,
        ttl_seconds: u64,
    ) -> Result<(), ServiceError>;

    /// Remove and return the verifier. A second call for the same state
    /// returns `None`.
    async fn consume_state(&self, state: &str) -> Result<Option<String>, ServiceError>;
}

/// Where to send the browser, and the state it will come back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub auth_url: String,
    pub state: String,
}

pub struct CredentialVerifier {
    provider: Arc<dyn IdentityProvider>,
    states: Arc<dyn OAuthStateStore>,
    state_ttl_seconds: u64,
}

impl CredentialVerifier {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        states: Arc<dyn OAuthStateStore>,
        state_ttl_seconds: u64,
    ) -> Self {
        Self {
            provider,
            states,
            state_ttl_seconds,
        }
    }

    pub async fn begin(&self) -> Result<LoginRedirect, ServiceError> {
        let state = random_token();
        let code_verifier = random_token();
        let code_challenge = pkce_challenge(&code_verifier);

        self.states
            .save_state(&state, &code_verifier, self.state_ttl_seconds)
            .await?;

        Ok(LoginRedirect {
            auth_url: self.provider.authorization_url(&state, &code_challenge),
            state,
        })
    }

    /// Consume `state` and exchange `code`. No side effects beyond the state
    /// consumption and the outbound provider call.
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
    ) -> Result<ExternalIdentity, ServiceError> {
        let Some(code_verifier) = self.states.consume_state(state).await? else {
            tracing::warn!("OAuth callback with unknown, expired or reused state");
            return Err(ServiceError::InvalidState);
        };

        self.provider.exchange_code(code, &code_verifier).await
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a PKCE verifier.
pub fn pkce_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

// ============================================================================
// Google
// ============================================================================

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    id: String,
    email: String,
    #[serde(default)]
    verified_email: bool,
    name: Option<String>,
    picture: Option<String>,
}

pub struct GoogleIdentityProvider {
    http: reqwest::Client,
    config: GoogleOAuthConfig,
}

impl GoogleIdentityProvider {
    pub fn new(config: GoogleOAuthConfig, timeout: Duration) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { http, config })
    }
}

/// Provider-side failure classification: 4xx means the grant itself is bad.
fn classify_status(status: reqwest::StatusCode, step: &str) -> ServiceError {
    let transient = status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
    if !transient && status.is_client_error() {
        ServiceError::InvalidGrant(format!("Google {} rejected the request ({})", step, status))
    } else {
        ServiceError::ProviderUnavailable(format!("Google {} returned {}", step, status))
    }
}

fn transport_error(err: reqwest::Error, step: &str) -> ServiceError {
    tracing::error!(error = %err, step, "Google request failed");
    ServiceError::ProviderUnavailable(format!("Google {} unreachable", step))
}

#[async_trait]
impl IdentityProvider for GoogleIdentityProvider {
    fn provider(&self) -> IdentProvider {
        IdentProvider::Google
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope=openid%20email%20profile&state={}&code_challenge={}&code_challenge_method=S256&prompt=select_account",
            GOOGLE_AUTH_URL,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }

    #[tracing::instrument(skip_all)]
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ExternalIdentity, ServiceError> {
        let token_res = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("code_verifier", code_verifier),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(e, "token endpoint"))?;

        if !token_res.status().is_success() {
            let status = token_res.status();
            let body = token_res.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Google token exchange error");
            return Err(classify_status(status, "token endpoint"));
        }

        let token: GoogleTokenResponse = token_res.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse Google token response");
            ServiceError::ProviderUnavailable("Malformed Google token response".to_string())
        })?;

        let info_res = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| transport_error(e, "userinfo"))?;

        if !info_res.status().is_success() {
            return Err(classify_status(info_res.status(), "userinfo"));
        }

        let info: GoogleUserInfo = info_res.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse Google user info");
            ServiceError::ProviderUnavailable("Malformed Google user info".to_string())
        })?;

        if !info.verified_email {
            return Err(ServiceError::InvalidGrant(
                "Google account email not verified".to_string(),
            ));
        }

        Ok(ExternalIdentity {
            provider: IdentProvider::Google,
            subject: info.id,
            email: info.email,
            name: info.name,
            picture: info.picture,
        })
    }
}

// ============================================================================
// In-process implementations
// ============================================================================

/// State store with lazy expiry.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStateStore for MemoryStateStore {
    async fn save_state(
        &self,
        state: &str,
        code_verifier: &str,
        ttl_seconds: u64,
    ) -> Result<(), ServiceError> {
        let expires = Instant::now() + Duration::from_secs(ttl_seconds);
        let mut states = self
            .states
            .lock()
            .map_err(|e| anyhow::anyhow!("State store mutex poisoned: {}", e))?;
        // Abandoned logins never consume their state.
        let now = Instant::now();
        states.retain(|_, (_, expires)| now < *expires);
        if states.contains_key(state) {
            return Err(ServiceError::Conflict("OAuth state collision".to_string()));
        }
        states.insert(state.to_string(), (code_verifier.to_string(), expires));
        Ok(())
    }

    async fn consume_state(&self, state: &str) -> Result<Option<String>, ServiceError> {
        let entry = self
            .states
            .lock()
            .map_err(|e| anyhow::anyhow!("State store mutex poisoned: {}", e))?
            .remove(state);
        Ok(entry
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(verifier, _)| verifier))
    }
}

/// Provider double. Codes are registered up front and, like real
/// authorization codes, work once.
#[derive(Default)]
pub struct MockIdentityProvider {
    codes: Mutex<HashMap<String, ExternalIdentity>>,
    unavailable: Mutex<bool>,
    verifiers: Mutex<Vec<String>>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_code(&self, code: &str, identity: ExternalIdentity) {
        if let Ok(mut codes) = self.codes.lock() {
            codes.insert(code.to_string(), identity);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = unavailable;
        }
    }

    /// PKCE verifiers received, in call order.
    pub fn received_verifiers(&self) -> Vec<String> {
        self.verifiers.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    fn provider(&self) -> IdentProvider {
        IdentProvider::Google
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        format!(
            "https://idp.test/authorize?state={}&code_challenge={}",
            urlencoding::encode(state),
            urlencoding::encode(code_challenge)
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<ExternalIdentity, ServiceError> {
        let unavailable = *self
            .unavailable
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock provider mutex poisoned: {}", e))?;
        if unavailable {
            return Err(ServiceError::ProviderUnavailable(
                "identity provider returned 503".to_string(),
            ));
        }

        self.verifiers
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock provider mutex poisoned: {}", e))?
            .push(code_verifier.to_string());

        self.codes
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock provider mutex poisoned: {}", e))?
            .remove(code)
            .ok_or_else(|| ServiceError::InvalidGrant("code is unknown or already used".to_string()))
    }
}
