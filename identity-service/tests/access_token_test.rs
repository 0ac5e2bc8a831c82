//! Access tokens are verified by signature and expiry only.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use identity_service::services::{Actor, Decision, ServiceError};

#[tokio::test]
async fn token_outlives_role_removal_until_expiry() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let user = app.login("google-sub-1", "ada@example.com").await;
    let editor = app.role("editor").await;
    let actor = Actor::fresh(admin.user.user_id);

    app.facade
        .assign_role(actor, user.user.user_id, editor.role_id)
        .await
        .unwrap();
    let refreshed = app.facade.refresh(&user.refresh_token).await.unwrap();

    app.facade
        .remove_role(Actor::fresh(admin.user.user_id), user.user.user_id, editor.role_id)
        .await
        .unwrap();

    // The snapshot still lists the role; the live check does not.
    let claims = app.facade.authenticate(&refreshed.access_token).unwrap();
    assert_eq!(claims.roles, vec!["editor".to_string()]);
    let decision = app
        .facade
        .check_access(user.user.user_id, "editor", None)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Denied);
}

#[tokio::test]
async fn token_outlives_logout_until_expiry() {
    let app = TestApp::spawn().await;
    let login = app.login("google-sub-1", "ada@example.com").await;

    app.facade.logout(&login.refresh_token).await.unwrap();

    app.facade.authenticate(&login.access_token).unwrap();
    let user = app.facade.current_user(&login.access_token).await.unwrap();
    assert_eq!(user.user_id, login.user.user_id);
}

#[tokio::test]
async fn token_past_expiry_is_expired() {
    let app = TestApp::spawn().await;
    let login = app.login("google-sub-1", "ada@example.com").await;

    let stale = app
        .jwt
        .generate_access_token_at(
            login.user.user_id,
            &[],
            Utc::now() - Duration::minutes(16),
        )
        .unwrap();

    let err = app.facade.authenticate(&stale).unwrap_err();
    assert!(matches!(err, ServiceError::Expired));
    let err = app.facade.current_user(&stale).await.unwrap_err();
    assert!(matches!(err, ServiceError::Expired));
}

#[tokio::test]
async fn token_just_inside_its_window_is_accepted() {
    let app = TestApp::spawn().await;
    let login = app.login("google-sub-1", "ada@example.com").await;

    let token = app
        .jwt
        .generate_access_token_at(
            login.user.user_id,
            &[],
            Utc::now() - Duration::minutes(14),
        )
        .unwrap();

    app.facade.authenticate(&token).unwrap();
}

#[tokio::test]
async fn malformed_and_tampered_tokens_are_invalid() {
    let app = TestApp::spawn().await;
    let login = app.login("google-sub-1", "ada@example.com").await;

    let err = app.facade.authenticate("not.a.jwt").unwrap_err();
    assert!(matches!(err, ServiceError::Invalid));

    // Another user's signature over this user's claims.
    let other = app.login("google-sub-2", "bob@example.com").await;
    let (signed_part, _) = login.access_token.rsplit_once('.').unwrap();
    let (_, foreign_signature) = other.access_token.rsplit_once('.').unwrap();
    let tampered = format!("{}.{}", signed_part, foreign_signature);

    let err = app.facade.authenticate(&tampered).unwrap_err();
    assert!(matches!(err, ServiceError::Invalid));
}
