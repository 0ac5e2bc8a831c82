//! PostgreSQL pool for the identity store.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::services::ServiceError;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Pool settings; acquiring a connection is bounded like every other store call.
pub fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
        .idle_timeout(IDLE_TIMEOUT)
        .max_lifetime(MAX_LIFETIME)
}

/// Open the pool and bring the identity schema up to date.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, ServiceError> {
    tracing::info!(max_connections = config.max_connections, "Connecting to PostgreSQL");
    let pool = pool_options(config).connect(&config.url).await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Identity schema migration failed: {}", e))?;

    tracing::info!("Identity schema is current");
    Ok(pool)
}
