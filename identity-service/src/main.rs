use std::net::SocketAddr;
use std::sync::Arc;

use identity_service::{
    build_router,
    config::{Environment, IdentityConfig, SwaggerMode},
    db,
    services::{
        metrics, seed_default_roles, Backends, Database, GoogleIdentityProvider, HealthCheck,
        JwtService, RedisService, SessionFacade, SessionSettings,
    },
    AppState, RouterOptions, ServiceInfo,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    metrics::init_metrics()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to register metrics: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let timeout = config.operation_timeout();

    tracing::info!("Initializing database connections");
    let pool = db::connect(&config.database).await?;
    let database = Arc::new(Database::new(pool, timeout));

    let seeded = seed_default_roles(database.as_ref()).await?;
    tracing::info!(seeded, "Default roles ensured");

    let redis = Arc::new(RedisService::new(&config.redis).await?);
    tracing::info!("Redis service initialized");

    let provider = Arc::new(GoogleIdentityProvider::new(config.google.clone(), timeout)?);

    let jwt = JwtService::new(&config.jwt)?;
    tracing::info!("JWT service initialized");

    let backends = Backends {
        users: database.clone(),
        access: database.clone(),
        refresh_tokens: database.clone(),
        states: redis.clone(),
        provider,
        bus: redis.clone(),
        outbox: database.clone(),
    };
    let settings = SessionSettings {
        state_ttl_seconds: config.oauth_state_ttl_seconds,
        refresh_token_expiry_days: config.jwt.refresh_token_expiry_days,
        operation_timeout: timeout,
        bootstrap_admin_emails: config.bootstrap_admin_emails.clone(),
    };
    let facade = Arc::new(SessionFacade::new(backends, jwt, settings));

    // Events left over from a previous run go out before new traffic.
    match facade.relay_pending_events().await {
        Ok(delivered) => tracing::info!(delivered, "Pending events relayed"),
        Err(e) => tracing::warn!(error = %e, "Pending events not relayed; the next mutation retries"),
    }

    let health: Vec<Arc<dyn HealthCheck>> = vec![
        database as Arc<dyn HealthCheck>,
        redis as Arc<dyn HealthCheck>,
    ];
    let state = AppState::new(
        facade,
        health,
        ServiceInfo {
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
        },
    );

    let options = RouterOptions {
        allowed_origins: config.security.allowed_origins.clone(),
        swagger_enabled: config.environment == Environment::Dev
            || config.swagger.enabled == SwaggerMode::Public,
    };
    let app = build_router(state, &options);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
