//! Login flow: state handling, PKCE, first-login creation and email policy.

mod common;

use common::{identity, TestApp, TestOptions};
use identity_service::models::{DomainEventType, RefreshToken, RefreshTokenState, ADMIN_ROLE};
use identity_service::services::{oauth::pkce_challenge, RefreshTokenStore, ServiceError};
use std::collections::HashSet;
use std::sync::Arc;

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| {
            urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string())
        })
    })
}

#[tokio::test]
async fn login_with_matching_state_returns_user_and_tokens() {
    let app = TestApp::spawn().await;
    app.provider
        .register_code("abc", identity("google-sub-1", "ada@example.com"));

    let redirect = app.facade.begin_login().await.unwrap();
    let login = app.facade.complete_login("abc", &redirect.state).await.unwrap();

    assert!(login.is_new_user);
    assert_eq!(login.user.email, "ada@example.com");
    assert!(!login.access_token.is_empty());
    assert!(!login.refresh_token.is_empty());
    assert_eq!(login.expires_in, 15 * 60);

    let claims = app.facade.authenticate(&login.access_token).unwrap();
    assert_eq!(claims.user_id().unwrap(), login.user.user_id);
}

#[tokio::test]
async fn first_login_emits_created_before_logged_in() {
    let app = TestApp::spawn().await;
    let login = app.login("google-sub-1", "ada@example.com").await;

    let types: Vec<DomainEventType> = app.bus.published().iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![DomainEventType::UserCreated, DomainEventType::UserLoggedIn]
    );
    assert!(app
        .bus
        .published()
        .iter()
        .all(|e| e.subject_user_id == login.user.user_id));
}

#[tokio::test]
async fn first_login_retried_after_bus_outage_still_announces_the_user() {
    let app = TestApp::spawn().await;
    app.bus.set_failing(true);
    let code = app.register_code(identity("google-sub-1", "ada@example.com"));
    let redirect = app.facade.begin_login().await.unwrap();

    let err = app
        .facade
        .complete_login(&code, &redirect.state)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unavailable { .. }));

    app.bus.set_failing(false);
    let login = app.login("google-sub-1", "ada@example.com").await;

    let created = app.events_of(DomainEventType::UserCreated);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].subject_user_id, login.user.user_id);
    assert_eq!(app.bus.published()[0].event_type, DomainEventType::UserCreated);
    let session = app
        .store
        .find_refresh_token_by_hash(&RefreshToken::hash_token(&login.refresh_token))
        .await
        .unwrap()
        .unwrap();
    let logged_in = app.events_of(DomainEventType::UserLoggedIn);
    assert_eq!(
        logged_in.last().map(|e| e.payload["session_family_id"].clone()),
        Some(serde_json::json!(session.family_id))
    );

    // The session opened by the failed attempt was never handed out.
    let abandoned: uuid::Uuid = logged_in[0].payload["session_family_id"]
        .as_str()
        .and_then(|id| id.parse().ok())
        .unwrap();
    assert_ne!(abandoned, session.family_id);
    let tokens = app.store.find_family_tokens(abandoned).await.unwrap();
    assert!(tokens.iter().all(|t| t.state() == RefreshTokenState::Revoked));
}

#[tokio::test]
async fn returning_user_keeps_id_and_updates_last_login() {
    let app = TestApp::spawn().await;
    let first = app.login("google-sub-1", "ada@example.com").await;
    app.bus.clear();

    let second = app.login("google-sub-1", "ada@example.com").await;

    assert!(!second.is_new_user);
    assert_eq!(second.user.user_id, first.user.user_id);
    assert!(second.user.last_login_utc >= first.user.last_login_utc);
    assert!(app.events_of(DomainEventType::UserCreated).is_empty());
    assert_eq!(app.events_of(DomainEventType::UserLoggedIn).len(), 1);
}

#[tokio::test]
async fn state_is_single_use() {
    let app = TestApp::spawn().await;
    let redirect = app.facade.begin_login().await.unwrap();

    let code = app.register_code(identity("google-sub-1", "ada@example.com"));
    app.facade.complete_login(&code, &redirect.state).await.unwrap();

    let code = app.register_code(identity("google-sub-1", "ada@example.com"));
    let err = app
        .facade
        .complete_login(&code, &redirect.state)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState));
}

#[tokio::test]
async fn forged_state_never_reaches_the_provider() {
    let app = TestApp::spawn().await;
    let code = app.register_code(identity("google-sub-1", "ada@example.com"));

    let err = app
        .facade
        .complete_login(&code, "forged-state")
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::InvalidState));
    assert!(app.provider.received_verifiers().is_empty());
    assert!(app.bus.published().is_empty());
}

#[tokio::test]
async fn provider_receives_verifier_matching_the_challenge() {
    let app = TestApp::spawn().await;
    let redirect = app.facade.begin_login().await.unwrap();
    assert_eq!(
        query_param(&redirect.auth_url, "state").as_deref(),
        Some(redirect.state.as_str())
    );
    let challenge = query_param(&redirect.auth_url, "code_challenge").unwrap();

    let code = app.register_code(identity("google-sub-1", "ada@example.com"));
    app.facade.complete_login(&code, &redirect.state).await.unwrap();

    let verifiers = app.provider.received_verifiers();
    assert_eq!(verifiers.len(), 1);
    assert_eq!(pkce_challenge(&verifiers[0]), challenge);
}

#[tokio::test]
async fn reused_code_is_an_invalid_grant() {
    let app = TestApp::spawn().await;
    let code = app.register_code(identity("google-sub-1", "ada@example.com"));

    let redirect = app.facade.begin_login().await.unwrap();
    app.facade.complete_login(&code, &redirect.state).await.unwrap();

    let redirect = app.facade.begin_login().await.unwrap();
    let err = app
        .facade
        .complete_login(&code, &redirect.state)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidGrant(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn provider_outage_is_retryable() {
    let app = TestApp::spawn().await;
    app.provider.set_unavailable(true);
    let code = app.register_code(identity("google-sub-1", "ada@example.com"));

    let redirect = app.facade.begin_login().await.unwrap();
    let err = app
        .facade
        .complete_login(&code, &redirect.state)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::ProviderUnavailable(_)));
    assert!(err.is_retryable());
    assert!(app.bus.published().is_empty());
}

#[tokio::test]
async fn email_owned_by_another_identity_is_a_conflict() {
    let app = TestApp::spawn().await;
    app.login("google-sub-1", "ada@example.com").await;

    let code = app.register_code(identity("google-sub-2", "Ada@Example.com"));
    let redirect = app.facade.begin_login().await.unwrap();
    let err = app
        .facade
        .complete_login(&code, &redirect.state)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::EmailConflict));
}

#[tokio::test]
async fn bootstrap_admin_gets_admin_role_on_creation() {
    let app = TestApp::spawn_with(TestOptions {
        bootstrap_admin_emails: vec!["Root@Example.com".to_string()],
        ..TestOptions::default()
    })
    .await;

    let login = app.login("google-root", "root@example.com").await;

    let claims = app.facade.authenticate(&login.access_token).unwrap();
    assert!(claims.roles.iter().any(|r| r == ADMIN_ROLE));

    let assigned = app.events_of(DomainEventType::RoleAssigned);
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].subject_user_id, login.user.user_id);

    let other = app.login("google-other", "other@example.com").await;
    let claims = app.facade.authenticate(&other.access_token).unwrap();
    assert!(claims.roles.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_logins_create_one_user() {
    let app = Arc::new(TestApp::spawn().await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            app.login("google-race", "race@example.com").await
        }));
    }

    let mut user_ids = HashSet::new();
    let mut created = 0;
    for handle in handles {
        let login = handle.await.unwrap();
        user_ids.insert(login.user.user_id);
        if login.is_new_user {
            created += 1;
        }
    }

    assert_eq!(user_ids.len(), 1);
    assert_eq!(created, 1);
    assert_eq!(app.events_of(DomainEventType::UserCreated).len(), 1);
    assert_eq!(app.events_of(DomainEventType::UserLoggedIn).len(), 8);
}
