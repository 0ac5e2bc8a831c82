//! Shared setup for identity-service integration tests.
//!
//! Wires the session facade over the in-process store, bus, state store and a
//! mock identity provider, so no PostgreSQL, Redis or Google is needed.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use identity_service::{
    build_router,
    config::JwtConfig,
    models::{DomainEvent, DomainEventType, ExternalIdentity, IdentProvider, Role, ADMIN_ROLE},
    services::{
        seed_default_roles, AccessStore, Backends, HealthCheck, InMemoryBus, JwtService,
        LoginResult, MemoryStateStore, MemoryStore, MockIdentityProvider, SessionFacade,
        SessionSettings,
    },
    AppState, RouterOptions, ServiceInfo,
};
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tower::util::ServiceExt;
use uuid::Uuid;

const TEST_PRIVATE_KEY: &str = include_str!("../fixtures/jwt_private.pem");
const TEST_PUBLIC_KEY: &str = include_str!("../fixtures/jwt_public.pem");

pub const TEST_ISSUER: &str = "identity-service-test";

/// Knobs for a test instance.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub bootstrap_admin_emails: Vec<String>,
    pub refresh_token_expiry_days: i64,
    pub access_token_expiry_minutes: i64,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            bootstrap_admin_emails: vec![],
            refresh_token_expiry_days: 7,
            access_token_expiry_minutes: 15,
        }
    }
}

pub struct TestApp {
    pub facade: Arc<SessionFacade>,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<InMemoryBus>,
    pub provider: Arc<MockIdentityProvider>,
    pub jwt: JwtService,
    pub router: Router,
    codes: AtomicUsize,
    _key_files: (NamedTempFile, NamedTempFile),
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let (private_file, public_file) = create_test_keys().expect("Failed to create test keys");
        let jwt_config = JwtConfig {
            private_key_path: private_file.path().to_string_lossy().into_owned(),
            public_key_path: public_file.path().to_string_lossy().into_owned(),
            issuer: TEST_ISSUER.to_string(),
            access_token_expiry_minutes: options.access_token_expiry_minutes,
            refresh_token_expiry_days: options.refresh_token_expiry_days,
        };
        let jwt = JwtService::new(&jwt_config).expect("Failed to create JWT service");

        let store = Arc::new(MemoryStore::new());
        seed_default_roles(store.as_ref())
            .await
            .expect("Failed to seed roles");

        let bus = Arc::new(InMemoryBus::new());
        let provider = Arc::new(MockIdentityProvider::new());

        let backends = Backends {
            users: store.clone(),
            access: store.clone(),
            refresh_tokens: store.clone(),
            states: Arc::new(MemoryStateStore::new()),
            provider: provider.clone(),
            bus: bus.clone(),
            outbox: store.clone(),
        };
        let settings = SessionSettings {
            state_ttl_seconds: 600,
            refresh_token_expiry_days: options.refresh_token_expiry_days,
            operation_timeout: Duration::from_secs(5),
            bootstrap_admin_emails: options.bootstrap_admin_emails,
        };
        let facade = Arc::new(SessionFacade::new(backends, jwt.clone(), settings));

        let health: Vec<Arc<dyn HealthCheck>> = vec![store.clone() as Arc<dyn HealthCheck>];
        let state = AppState::new(
            facade.clone(),
            health,
            ServiceInfo {
                service_name: "identity-service-test".to_string(),
                service_version: "0.0.0".to_string(),
            },
        );
        let router = build_router(
            state,
            &RouterOptions {
                allowed_origins: vec!["http://localhost:3000".to_string()],
                swagger_enabled: false,
            },
        );

        Self {
            facade,
            store,
            bus,
            provider,
            jwt,
            router,
            codes: AtomicUsize::new(0),
            _key_files: (private_file, public_file),
        }
    }

    /// Register a fresh single-use authorization code for `identity`.
    pub fn register_code(&self, identity: ExternalIdentity) -> String {
        let code = format!("code-{}", self.codes.fetch_add(1, Ordering::SeqCst));
        self.provider.register_code(&code, identity);
        code
    }

    /// Full login round trip through the facade.
    pub async fn login(&self, subject: &str, email: &str) -> LoginResult {
        let code = self.register_code(identity(subject, email));
        let redirect = self.facade.begin_login().await.expect("begin_login failed");
        self.facade
            .complete_login(&code, &redirect.state)
            .await
            .expect("complete_login failed")
    }

    /// Log a user in and grant them the admin role directly in the store.
    pub async fn login_admin(&self, subject: &str, email: &str) -> LoginResult {
        let login = self.login(subject, email).await;
        let admin = self.role(ADMIN_ROLE).await;
        self.store
            .insert_user_role(login.user.user_id, admin.role_id, &[])
            .await
            .expect("Failed to grant admin");
        login
    }

    pub async fn role(&self, name: &str) -> Role {
        self.store
            .list_roles()
            .await
            .expect("Failed to list roles")
            .into_iter()
            .find(|r| r.role_name == name)
            .unwrap_or_else(|| panic!("role {} not seeded", name))
    }

    pub fn events_of(&self, event_type: DomainEventType) -> Vec<DomainEvent> {
        self.bus
            .published()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Send one request through the router and decode the JSON body
    /// (`Value::Null` when empty).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request_with_id(method, uri, bearer, body, None).await
    }

    pub async fn request_with_id(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
        request_id: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(id) = request_id {
            builder = builder.header("x-request-id", id);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }
}

pub fn identity(subject: &str, email: &str) -> ExternalIdentity {
    ExternalIdentity {
        provider: IdentProvider::Google,
        subject: subject.to_string(),
        email: email.to_string(),
        name: Some("Test User".to_string()),
        picture: None,
    }
}

pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

fn create_test_keys() -> std::io::Result<(NamedTempFile, NamedTempFile)> {
    let mut private_file = NamedTempFile::new()?;
    private_file.write_all(TEST_PRIVATE_KEY.as_bytes())?;

    let mut public_file = NamedTempFile::new()?;
    public_file.write_all(TEST_PUBLIC_KEY.as_bytes())?;

    Ok((private_file, public_file))
}
