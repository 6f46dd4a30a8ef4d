//! The operator-facing HTTP surface.

use crate::{
    services::{CoreService, Scheduler},
    Environment,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
    LatencyUnit,
};
use tracing::{Level, Span};

mod health;

#[derive(Clone)]
pub struct ApiState {
    pub core: CoreService,
    pub scheduler: Scheduler,
    pub environment: Environment,
}

/// A generic API error rendered as `{error, message}` JSON.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            message: "the requested resource was not found".to_string(),
        }
    }

    pub fn busy() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: "busy",
            message: "a build is already in progress".to_string(),
        }
    }

    /// An internal error. Outside development the underlying message is
    /// suppressed so backend details never leak to callers.
    pub fn internal(environment: Environment, err: impl ToString) -> Self {
        let message = match environment {
            Environment::Development => err.to_string(),
            Environment::Production => "internal service error".to_string(),
        };
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal",
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

async fn not_found() -> ApiError {
    ApiError::not_found()
}

/// The service descriptor at `/`.
async fn descriptor(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> Json<serde_json::Value> {
    let cache = state.core.cache().stats().await;
    let scheduler = state.scheduler.status().await;

    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
        "features": {
            "cache": { "enabled": cache.enabled, "connected": cache.connected },
            "datastore": state.core.store().kind(),
        },
        "schedule": {
            "intervalMinutes": scheduler.interval_minutes,
            "cron": scheduler.cron_expression,
        },
        "endpoints": {
            "descriptor": "GET /",
            "health": "GET /health",
            "status": "GET /health/status",
            "cache": "GET /health/cache",
            "cacheClear": "POST /health/cache/clear",
            "cacheWarmup": "POST /health/cache/warmup",
            "build": "POST /health/build",
        },
    }))
}

/// Creates the router for the API.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(descriptor))
        .nest("/health", health::router())
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_request(|request: &Request<Body>, _span: &Span| {
                    tracing::debug!("starting {} {}", request.method(), request.uri().path())
                })
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::DEBUG)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]),
        )
        .with_state(state)
}
