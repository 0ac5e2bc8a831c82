use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Map, Value};

use crate::AppState;

/// Service health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "All dependencies reachable"),
        (status = 503, description = "At least one dependency is down")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = Map::new();
    let mut healthy = true;

    for check in state.health.iter() {
        let status = match check.health_check().await {
            Ok(()) => "up",
            Err(e) => {
                tracing::error!(component = check.component(), error = %e, "Health check failed");
                healthy = false;
                "down"
            }
        };
        checks.insert(check.component().to_string(), Value::from(status));
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": state.info.service_name,
            "version": state.info.service_version,
            "checks": checks,
        })),
    )
}
