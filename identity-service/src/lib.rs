pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Json, Router,
};
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::services::{HealthCheck, SessionFacade};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::auth::begin_login,
        handlers::auth::google_callback,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::me,
        handlers::auth::authorize,
        handlers::admin::assign_role,
        handlers::admin::remove_role,
        handlers::admin::assign_organization,
        handlers::admin::remove_organization,
        handlers::admin::list_users,
        handlers::admin::list_roles,
        handlers::admin::create_role,
        handlers::admin::update_role,
        handlers::admin::delete_role,
        handlers::admin::list_organizations,
        handlers::admin::create_organization,
        handlers::admin::update_organization,
        handlers::admin::delete_organization,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::LoginRedirectResponse,
            dtos::auth::LoginResponse,
            dtos::auth::RefreshRequest,
            dtos::auth::RefreshResponse,
            dtos::auth::LogoutRequest,
            dtos::auth::MeResponse,
            dtos::auth::AuthorizeResponse,
            dtos::admin::AssignmentResponse,
            dtos::admin::AssignOrganizationRequest,
            dtos::admin::CreateRoleRequest,
            dtos::admin::UpdateRoleRequest,
            dtos::admin::CreateOrganizationRequest,
            dtos::admin::UpdateOrganizationRequest,
            services::Decision,
            services::AssignmentOutcome,
            models::User,
            models::Role,
            models::Organization,
            models::OrgMembership,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Google login and session tokens"),
        (name = "Authorization", description = "Role checks against live assignments"),
        (name = "Admin", description = "Role, organization and user administration"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Name and version reported by `/health`.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_name: String,
    pub service_version: String,
}

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<SessionFacade>,
    pub health: Arc<Vec<Arc<dyn HealthCheck>>>,
    pub info: ServiceInfo,
}

impl AppState {
    pub fn new(
        facade: Arc<SessionFacade>,
        health: Vec<Arc<dyn HealthCheck>>,
        info: ServiceInfo,
    ) -> Self {
        Self {
            facade,
            health: Arc::new(health),
            info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub allowed_origins: Vec<String>,
    pub swagger_enabled: bool,
}

pub fn build_router(state: AppState, options: &RouterOptions) -> Router {
    let protected_routes = Router::new()
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/authorize", get(handlers::auth::authorize))
        .route("/admin/users", get(handlers::admin::list_users))
        .route(
            "/admin/users/:user_id/roles/:role_id",
            put(handlers::admin::assign_role).delete(handlers::admin::remove_role),
        )
        .route(
            "/admin/users/:user_id/organizations/:org_id",
            put(handlers::admin::assign_organization)
                .delete(handlers::admin::remove_organization),
        )
        .route(
            "/admin/roles",
            get(handlers::admin::list_roles).post(handlers::admin::create_role),
        )
        .route(
            "/admin/roles/:role_id",
            axum::routing::patch(handlers::admin::update_role)
                .delete(handlers::admin::delete_role),
        )
        .route(
            "/admin/organizations",
            get(handlers::admin::list_organizations).post(handlers::admin::create_organization),
        )
        .route(
            "/admin/organizations/:org_id",
            axum::routing::patch(handlers::admin::update_organization)
                .delete(handlers::admin::delete_organization),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let mut app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::metrics));

    if options.swagger_enabled {
        app = app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        // OpenAPI JSON stays available for programmatic access
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    app.route("/auth/login", get(handlers::auth::begin_login))
        .route("/auth/google/callback", get(handlers::auth::google_callback))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .merge(protected_routes)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(cors_layer(&options.allowed_origins))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(parse_origins(allowed_origins))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

fn parse_origins(allowed_origins: &[String]) -> Vec<HeaderValue> {
    allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect()
}
