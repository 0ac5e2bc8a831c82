//! PostgreSQL implementation of the identity stores.
//!
//! Every call is bounded by the configured store timeout so a stalled
//! database surfaces as `Unavailable` instead of hanging the request.
//! Mutations that carry events write them to `event_outbox` in the same
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::store::{
    bounded, AccessStore, EventOutbox, HealthCheck, RefreshTokenStore, RoleDeletion, UserStore,
};
use super::ServiceError;
use crate::models::{
    normalize_email, DomainEvent, DomainEventType, IdentProvider, OrgMembership, Organization,
    OrganizationChanges, RefreshFamily, RefreshToken, Role, RoleChanges, User,
};

const REFRESH_TOKEN_COLUMNS: &str = r#"
    t.token_id, t.family_id, t.user_id, t.token_hash, t.issued_utc, t.expiry_utc, t.used_utc,
    COALESCE(t.revoked_utc, f.revoked_utc) AS revoked_utc
"#;

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    timeout: Duration,
}

impl Database {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run<T, F>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        bounded("store", self.timeout, async { fut.await.map_err(ServiceError::from) }).await
    }

    /// Run a single-row insert or delete and, when it touched a row, record
    /// `events` in the same transaction.
    async fn mutate_with_events<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            if query.execute(&mut *tx).await?.rows_affected() != 1 {
                tx.rollback().await?;
                return Ok(false);
            }
            record_events(&mut tx, events).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(true)
        })
        .await
    }
}

#[async_trait]
impl HealthCheck for Database {
    fn component(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.run(sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                e
            })?;
        Ok(())
    }
}

// ==================== Users ====================

#[async_trait]
impl UserStore for Database {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        self.run(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn find_user_by_identity(
        &self,
        provider: IdentProvider,
        subject: &str,
    ) -> Result<Option<User>, ServiceError> {
        self.run(
            sqlx::query_as::<_, User>(
                "SELECT * FROM users WHERE ident_provider_code = $1 AND ident_subject = $2",
            )
            .bind(provider.as_str())
            .bind(subject)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        self.run(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
                .bind(normalize_email(email))
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn insert_user_if_absent(
        &self,
        user: &User,
        role_ids: &[Uuid],
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO users (user_id, ident_provider_code, ident_subject, email,
                                   display_name, picture_url, created_utc, last_login_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user.user_id)
            .bind(&user.ident_provider_code)
            .bind(&user.ident_subject)
            .bind(&user.email)
            .bind(&user.display_name)
            .bind(&user.picture_url)
            .bind(user.created_utc)
            .bind(user.last_login_utc)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted != 1 {
                tx.rollback().await?;
                return Ok(false);
            }

            for role_id in role_ids {
                sqlx::query(
                    "INSERT INTO user_roles (user_id, role_id, assigned_utc) VALUES ($1, $2, $3)",
                )
                .bind(user.user_id)
                .bind(role_id)
                .bind(user.created_utc)
                .execute(&mut *tx)
                .await?;
            }
            record_events(&mut tx, events).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(true)
        })
        .await
    }

    async fn record_login(
        &self,
        user_id: Uuid,
        display_name: Option<&str>,
        picture_url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<User, ServiceError> {
        self.run(
            sqlx::query_as::<_, User>(
                r#"
                UPDATE users
                SET last_login_utc = $2,
                    display_name = COALESCE($3, display_name),
                    picture_url = COALESCE($4, picture_url)
                WHERE user_id = $1
                RETURNING *
                "#,
            )
            .bind(user_id)
            .bind(at)
            .bind(display_name)
            .bind(picture_url)
            .fetch_optional(&self.pool),
        )
        .await?
        .ok_or(ServiceError::NotFound("User"))
    }

    async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, ServiceError> {
        self.run(
            sqlx::query_as::<_, User>(
                "SELECT * FROM users ORDER BY created_utc, user_id LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool),
        )
        .await
    }
}

// ==================== Roles & Organizations ====================

#[async_trait]
impl AccessStore for Database {
    async fn list_roles(&self) -> Result<Vec<Role>, ServiceError> {
        self.run(
            sqlx::query_as::<_, Role>("SELECT * FROM roles ORDER BY role_name")
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn find_role_by_id(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        self.run(
            sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1")
                .bind(role_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn insert_role(&self, role: &Role) -> Result<(), ServiceError> {
        self.run(
            sqlx::query(
                r#"
                INSERT INTO roles (role_id, role_name, description, created_utc)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(role.role_id)
            .bind(&role.role_name)
            .bind(&role.description)
            .bind(role.created_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn ensure_role(&self, role: &Role) -> Result<bool, ServiceError> {
        let result = self
            .run(
                sqlx::query(
                    r#"
                    INSERT INTO roles (role_id, role_name, description, created_utc)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (role_name) DO NOTHING
                    "#,
                )
                .bind(role.role_id)
                .bind(&role.role_name)
                .bind(&role.description)
                .bind(role.created_utc)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_role(
        &self,
        role_id: Uuid,
        changes: &RoleChanges,
    ) -> Result<Option<Role>, ServiceError> {
        self.run(
            sqlx::query_as::<_, Role>(
                r#"
                UPDATE roles
                SET role_name = COALESCE($2, role_name),
                    description = COALESCE($3, description)
                WHERE role_id = $1
                RETURNING *
                "#,
            )
            .bind(role_id)
            .bind(&changes.role_name)
            .bind(&changes.description)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<RoleDeletion, ServiceError> {
        self.run(async {
            let mut tx = self.pool.begin().await?;

            let holders: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM user_roles WHERE role_id = $1")
                    .bind(role_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if holders > 0 {
                return Ok(RoleDeletion::InUse(holders));
            }

            let deleted = sqlx::query("DELETE FROM roles WHERE role_id = $1")
                .bind(role_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;

            Ok::<_, sqlx::Error>(if deleted == 1 {
                RoleDeletion::Deleted
            } else {
                RoleDeletion::NotFound
            })
        })
        .await
    }

    async fn role_names_for_user(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError> {
        self.run(
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT r.role_name
                FROM user_roles ur
                JOIN roles r ON r.role_id = ur.role_id
                WHERE ur.user_id = $1
                ORDER BY r.role_name
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn insert_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.mutate_with_events(
            sqlx::query(
                r#"
                INSERT INTO user_roles (user_id, role_id, assigned_utc)
                VALUES ($1, $2, NOW())
                ON CONFLICT (user_id, role_id) DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(role_id),
            events,
        )
        .await
    }

    async fn delete_user_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.mutate_with_events(
            sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
                .bind(user_id)
                .bind(role_id),
            events,
        )
        .await
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, ServiceError> {
        self.run(
            sqlx::query_as::<_, Organization>("SELECT * FROM organizations ORDER BY org_name")
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn find_organization_by_id(
        &self,
        org_id: Uuid,
    ) -> Result<Option<Organization>, ServiceError> {
        self.run(
            sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn insert_organization(&self, org: &Organization) -> Result<(), ServiceError> {
        self.run(
            sqlx::query(
                r#"
                INSERT INTO organizations (org_id, org_name, description, metadata,
                                           created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(org.org_id)
            .bind(&org.org_name)
            .bind(&org.description)
            .bind(&org.metadata)
            .bind(org.created_utc)
            .bind(org.updated_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn update_organization(
        &self,
        org_id: Uuid,
        changes: &OrganizationChanges,
    ) -> Result<Option<Organization>, ServiceError> {
        self.run(
            sqlx::query_as::<_, Organization>(
                r#"
                UPDATE organizations
                SET org_name = COALESCE($2, org_name),
                    description = COALESCE($3, description),
                    metadata = COALESCE($4, metadata),
                    updated_utc = NOW()
                WHERE org_id = $1
                RETURNING *
                "#,
            )
            .bind(org_id)
            .bind(&changes.org_name)
            .bind(&changes.description)
            .bind(&changes.metadata)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn delete_organization(&self, org_id: Uuid) -> Result<bool, ServiceError> {
        // Memberships go with it via ON DELETE CASCADE.
        let result = self
            .run(
                sqlx::query("DELETE FROM organizations WHERE org_id = $1")
                    .bind(org_id)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_membership(
        &self,
        membership: &OrgMembership,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.mutate_with_events(
            sqlx::query(
                r#"
                INSERT INTO user_organizations (user_id, org_id, membership_label, joined_utc)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, org_id) DO NOTHING
                "#,
            )
            .bind(membership.user_id)
            .bind(membership.org_id)
            .bind(&membership.membership_label)
            .bind(membership.joined_utc),
            events,
        )
        .await
    }

    async fn delete_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.mutate_with_events(
            sqlx::query("DELETE FROM user_organizations WHERE user_id = $1 AND org_id = $2")
                .bind(user_id)
                .bind(org_id),
            events,
        )
        .await
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<OrgMembership>, ServiceError> {
        self.run(
            sqlx::query_as::<_, OrgMembership>(
                "SELECT * FROM user_organizations WHERE user_id = $1 AND org_id = $2",
            )
            .bind(user_id)
            .bind(org_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<OrgMembership>, ServiceError> {
        self.run(
            sqlx::query_as::<_, OrgMembership>(
                "SELECT * FROM user_organizations WHERE user_id = $1 ORDER BY joined_utc",
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await
    }
}

// ==================== Refresh Tokens ====================

#[async_trait]
impl RefreshTokenStore for Database {
    async fn insert_family(
        &self,
        family: &RefreshFamily,
        first: &RefreshToken,
        events: &[DomainEvent],
    ) -> Result<(), ServiceError> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO refresh_token_families (family_id, user_id, created_utc, revoked_utc)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(family.family_id)
            .bind(family.user_id)
            .bind(family.created_utc)
            .bind(family.revoked_utc)
            .execute(&mut *tx)
            .await?;
            insert_token(&mut tx, first).await?;
            record_events(&mut tx, events).await?;
            tx.commit().await
        })
        .await
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        let sql = format!(
            r#"
            SELECT {REFRESH_TOKEN_COLUMNS}
            FROM refresh_tokens t
            JOIN refresh_token_families f ON f.family_id = t.family_id
            WHERE t.token_hash = $1
            "#
        );
        self.run(
            sqlx::query_as::<_, RefreshToken>(&sql)
                .bind(token_hash)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn rotate_refresh_token(
        &self,
        token_id: Uuid,
        successor: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        self.run(async {
            let mut tx = self.pool.begin().await?;

            // Concurrent presenters serialize on the row lock; the loser
            // re-evaluates the predicate and matches nothing.
            let claimed = sqlx::query(
                r#"
                UPDATE refresh_tokens t
                SET used_utc = $2
                FROM refresh_token_families f
                WHERE t.token_id = $1
                  AND f.family_id = t.family_id
                  AND t.used_utc IS NULL
                  AND t.revoked_utc IS NULL
                  AND f.revoked_utc IS NULL
                  AND t.expiry_utc > $2
                "#,
            )
            .bind(token_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if claimed != 1 {
                tx.rollback().await?;
                return Ok(false);
            }

            insert_token(&mut tx, successor).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(true)
        })
        .await
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
        events: &[DomainEvent],
    ) -> Result<bool, ServiceError> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            let newly_revoked = sqlx::query(
                r#"
                UPDATE refresh_token_families
                SET revoked_utc = $2
                WHERE family_id = $1 AND revoked_utc IS NULL
                "#,
            )
            .bind(family_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            sqlx::query(
                r#"
                UPDATE refresh_tokens
                SET revoked_utc = $2
                WHERE family_id = $1 AND revoked_utc IS NULL
                "#,
            )
            .bind(family_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            record_events(&mut tx, events).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(newly_revoked == 1)
        })
        .await
    }

    async fn find_family_tokens(
        &self,
        family_id: Uuid,
    ) -> Result<Vec<RefreshToken>, ServiceError> {
        let sql = format!(
            r#"
            SELECT {REFRESH_TOKEN_COLUMNS}
            FROM refresh_tokens t
            JOIN refresh_token_families f ON f.family_id = t.family_id
            WHERE t.family_id = $1
            ORDER BY t.issued_utc
            "#
        );
        self.run(
            sqlx::query_as::<_, RefreshToken>(&sql)
                .bind(family_id)
                .fetch_all(&self.pool),
        )
        .await
    }
}

// ==================== Outbox ====================

#[derive(sqlx::FromRow)]
struct OutboxRow {
    seq: i64,
    event_id: Uuid,
    event_type: String,
    subject_user_id: Uuid,
    payload: serde_json::Value,
    occurred_utc: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for DomainEvent {
    type Error = ServiceError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let event_type: DomainEventType = row
            .event_type
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(DomainEvent {
            event_id: row.event_id,
            event_type,
            subject_user_id: row.subject_user_id,
            payload: row.payload,
            occurred_utc: row.occurred_utc,
        })
    }
}

#[async_trait]
impl EventOutbox for Database {
    async fn claim_events(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<DomainEvent>, ServiceError> {
        // SKIP LOCKED keeps concurrent relays from claiming the same rows.
        let mut rows = self
            .run(
                sqlx::query_as::<_, OutboxRow>(
                    r#"
                    UPDATE event_outbox
                    SET claimed_until = NOW() + ($2 * INTERVAL '1 millisecond')
                    WHERE seq IN (
                        SELECT seq FROM event_outbox
                        WHERE claimed_until IS NULL OR claimed_until <= NOW()
                        ORDER BY seq
                        LIMIT $1
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING seq, event_id, event_type, subject_user_id, payload, occurred_utc
                    "#,
                )
                .bind(limit as i64)
                .bind(lease.as_millis() as i64)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(DomainEvent::try_from).collect()
    }

    async fn complete_events(&self, event_ids: &[Uuid]) -> Result<(), ServiceError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        self.run(
            sqlx::query("DELETE FROM event_outbox WHERE event_id = ANY($1)")
                .bind(event_ids)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn release_events(&self, event_ids: &[Uuid]) -> Result<(), ServiceError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        self.run(
            sqlx::query("UPDATE event_outbox SET claimed_until = NULL WHERE event_id = ANY($1)")
                .bind(event_ids)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

async fn record_events(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    events: &[DomainEvent],
) -> Result<(), sqlx::Error> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO event_outbox (event_id, event_type, subject_user_id, payload, occurred_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_type.as_str())
        .bind(event.subject_user_id)
        .bind(&event.payload)
        .bind(event.occurred_utc)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_token(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    token: &RefreshToken,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (token_id, family_id, user_id, token_hash, issued_utc,
                                    expiry_utc, used_utc, revoked_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(token.token_id)
    .bind(token.family_id)
    .bind(token.user_id)
    .bind(&token.token_hash)
    .bind(token.issued_utc)
    .bind(token.expiry_utc)
    .bind(token.used_utc)
    .bind(token.revoked_utc)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
