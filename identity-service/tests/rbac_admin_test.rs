//! Admin-gated assignments and the flat RBAC model.

mod common;

use common::{new_id, TestApp};
use identity_service::models::{DomainEvent, DomainEventType, RoleChanges};
use identity_service::services::{
    AccessStore, Actor, AssignmentOutcome, Decision, ServiceError,
};
use std::collections::BTreeSet;
use uuid::Uuid;

#[tokio::test]
async fn non_admin_cannot_assign_roles() {
    let app = TestApp::spawn().await;
    let actor = app.login("google-actor", "actor@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let editor = app.role("editor").await;
    app.bus.clear();

    let err = app
        .facade
        .assign_role(Actor::fresh(actor.user.user_id), target.user.user_id, editor.role_id)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Forbidden(_)));
    assert!(app.events_of(DomainEventType::RoleAssigned).is_empty());
    assert!(app
        .facade
        .effective_permissions(target.user.user_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn non_admin_cannot_touch_memberships() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let actor = app.login("google-actor", "actor@example.com").await;
    let org = app
        .facade
        .create_organization(Actor::fresh(admin.user.user_id), "Acme", None, None)
        .await
        .unwrap();
    app.bus.clear();

    let err = app
        .facade
        .assign_organization(Actor::fresh(actor.user.user_id), actor.user.user_id, org.org_id, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Forbidden(_)));
    assert!(app.bus.published().is_empty());
    assert!(app.facade.memberships(actor.user.user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_assignment_is_a_silent_no_op() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let editor = app.role("editor").await;
    app.bus.clear();

    let first = app
        .facade
        .assign_role(Actor::fresh(admin.user.user_id), target.user.user_id, editor.role_id)
        .await
        .unwrap();
    let second = app
        .facade
        .assign_role(Actor::fresh(admin.user.user_id), target.user.user_id, editor.role_id)
        .await
        .unwrap();

    assert_eq!(first, AssignmentOutcome::Applied);
    assert_eq!(second, AssignmentOutcome::Unchanged);
    assert_eq!(app.events_of(DomainEventType::RoleAssigned).len(), 1);
    assert_eq!(
        app.store.role_names_for_user(target.user.user_id).await.unwrap(),
        vec!["editor".to_string()]
    );
}

#[tokio::test]
async fn assign_then_remove_restores_permissions() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let reader = app.role("reader").await;
    let editor = app.role("editor").await;
    let actor = Actor::fresh(admin.user.user_id);

    app.facade
        .assign_role(actor, target.user.user_id, reader.role_id)
        .await
        .unwrap();
    let before = app
        .facade
        .effective_permissions(target.user.user_id)
        .await
        .unwrap();

    app.facade
        .assign_role(Actor::fresh(admin.user.user_id), target.user.user_id, editor.role_id)
        .await
        .unwrap();
    app.facade
        .remove_role(Actor::fresh(admin.user.user_id), target.user.user_id, editor.role_id)
        .await
        .unwrap();

    let after = app
        .facade
        .effective_permissions(target.user.user_id)
        .await
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(after, BTreeSet::from(["reader".to_string()]));
    assert_eq!(app.events_of(DomainEventType::RoleRemoved).len(), 1);
}

#[tokio::test]
async fn admin_does_not_imply_other_roles() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;

    let decision = app
        .facade
        .check_access(admin.user.user_id, "manager", None)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Denied);
}

#[tokio::test]
async fn organization_checks_need_membership_unless_admin() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let user = app.login("google-sub-1", "ada@example.com").await;
    let editor = app.role("editor").await;
    let org = app
        .facade
        .create_organization(Actor::fresh(admin.user.user_id), "Acme", None, None)
        .await
        .unwrap();
    app.facade
        .assign_role(Actor::fresh(admin.user.user_id), user.user.user_id, editor.role_id)
        .await
        .unwrap();

    let outside = app
        .facade
        .check_access(user.user.user_id, "editor", Some(org.org_id))
        .await
        .unwrap();
    assert_eq!(outside, Decision::Denied);

    let outcome = app
        .facade
        .assign_organization(
            Actor::fresh(admin.user.user_id),
            user.user.user_id,
            org.org_id,
            Some("owner".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::Applied);

    let inside = app
        .facade
        .check_access(user.user.user_id, "editor", Some(org.org_id))
        .await
        .unwrap();
    assert_eq!(inside, Decision::Allowed);

    let memberships = app.facade.memberships(user.user.user_id).await.unwrap();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].membership_label, "owner");

    // Admin bypasses membership but still needs the role itself.
    let bypass = app
        .facade
        .check_access(admin.user.user_id, "admin", Some(org.org_id))
        .await
        .unwrap();
    assert_eq!(bypass, Decision::Allowed);
}

#[tokio::test]
async fn membership_removal_is_idempotent() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let user = app.login("google-sub-1", "ada@example.com").await;
    let org = app
        .facade
        .create_organization(Actor::fresh(admin.user.user_id), "Acme", None, None)
        .await
        .unwrap();
    app.facade
        .assign_organization(Actor::fresh(admin.user.user_id), user.user.user_id, org.org_id, None)
        .await
        .unwrap();

    let first = app
        .facade
        .remove_organization(Actor::fresh(admin.user.user_id), user.user.user_id, org.org_id)
        .await
        .unwrap();
    let second = app
        .facade
        .remove_organization(Actor::fresh(admin.user.user_id), user.user.user_id, org.org_id)
        .await
        .unwrap();

    assert_eq!(first, AssignmentOutcome::Applied);
    assert_eq!(second, AssignmentOutcome::Unchanged);
    assert_eq!(app.events_of(DomainEventType::OrganizationAssigned).len(), 1);
    assert_eq!(app.events_of(DomainEventType::OrganizationRemoved).len(), 1);
}

#[tokio::test]
async fn assignment_to_missing_user_or_role_is_not_found() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let editor = app.role("editor").await;

    let err = app
        .facade
        .assign_role(Actor::fresh(admin.user.user_id), new_id(), editor.role_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("User")));

    let err = app
        .facade
        .assign_role(Actor::fresh(admin.user.user_id), admin.user.user_id, new_id())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("Role")));
}

#[tokio::test]
async fn event_ids_follow_the_operation_id() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let editor = app.role("editor").await;
    let operation_id = Uuid::new_v4();

    app.facade
        .assign_role(
            Actor::new(admin.user.user_id, operation_id),
            target.user.user_id,
            editor.role_id,
        )
        .await
        .unwrap();

    let events = app.events_of(DomainEventType::RoleAssigned);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event_id,
        DomainEvent::derive_id(
            DomainEventType::RoleAssigned,
            target.user.user_id,
            editor.role_id,
            operation_id,
        )
    );
}

#[tokio::test]
async fn one_operation_assigning_two_roles_emits_distinct_events() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let actor = Actor::fresh(admin.user.user_id);

    for name in ["editor", "reader"] {
        let role = app.role(name).await;
        app.facade
            .assign_role(actor, target.user.user_id, role.role_id)
            .await
            .unwrap();
    }

    let events = app.events_of(DomainEventType::RoleAssigned);
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].event_id, events[1].event_id);
}

#[tokio::test]
async fn publish_failure_keeps_the_mutation() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let editor = app.role("editor").await;

    app.bus.set_failing(true);
    let err = app
        .facade
        .assign_role(Actor::fresh(admin.user.user_id), target.user.user_id, editor.role_id)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(matches!(err, ServiceError::Unavailable { .. }));
    let decision = app
        .facade
        .check_access(target.user.user_id, "editor", None)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Allowed);
}

#[tokio::test]
async fn retry_after_publish_failure_delivers_the_event_once() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let target = app.login("google-target", "target@example.com").await;
    let editor = app.role("editor").await;
    let actor = Actor::fresh(admin.user.user_id);
    app.bus.clear();

    app.bus.set_failing(true);
    let err = app
        .facade
        .assign_role(actor, target.user.user_id, editor.role_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unavailable { .. }));
    assert!(app.events_of(DomainEventType::RoleAssigned).is_empty());

    app.bus.set_failing(false);
    let retried = app
        .facade
        .assign_role(actor, target.user.user_id, editor.role_id)
        .await
        .unwrap();

    assert_eq!(retried, AssignmentOutcome::Unchanged);
    let events = app.events_of(DomainEventType::RoleAssigned);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event_id,
        DomainEvent::derive_id(
            DomainEventType::RoleAssigned,
            target.user.user_id,
            editor.role_id,
            actor.operation_id,
        )
    );
}

#[tokio::test]
async fn held_roles_cannot_be_deleted() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let actor = Actor::fresh(admin.user.user_id);

    let auditor = app
        .facade
        .create_role(actor, " auditor ", Some("Reads audit trails".to_string()))
        .await
        .unwrap();
    assert_eq!(auditor.role_name, "auditor");

    app.facade
        .assign_role(actor, admin.user.user_id, auditor.role_id)
        .await
        .unwrap();
    let err = app
        .facade
        .delete_role(actor, auditor.role_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    app.facade
        .remove_role(actor, admin.user.user_id, auditor.role_id)
        .await
        .unwrap();
    app.facade.delete_role(actor, auditor.role_id).await.unwrap();
    assert!(app.store.find_role_by_id(auditor.role_id).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_role_names_conflict() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let actor = Actor::fresh(admin.user.user_id);

    let err = app
        .facade
        .create_role(actor, "editor", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let reader = app.role("reader").await;
    let err = app
        .facade
        .update_role(
            actor,
            reader.role_id,
            RoleChanges {
                role_name: Some("editor".to_string()),
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn deleting_an_organization_drops_its_memberships() {
    let app = TestApp::spawn().await;
    let admin = app.login_admin("google-admin", "admin@example.com").await;
    let user = app.login("google-sub-1", "ada@example.com").await;
    let actor = Actor::fresh(admin.user.user_id);
    let org = app
        .facade
        .create_organization(actor, "Acme", None, Some(serde_json::json!({"tier": "gold"})))
        .await
        .unwrap();
    app.facade
        .assign_organization(actor, user.user.user_id, org.org_id, None)
        .await
        .unwrap();

    app.facade.delete_organization(actor, org.org_id).await.unwrap();

    assert!(app.facade.memberships(user.user.user_id).await.unwrap().is_empty());
    let err = app
        .facade
        .delete_organization(actor, org.org_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound("Organization")));
}
