//! Health and maintenance endpoints.

use super::{ApiError, ApiState};
use crate::{
    cache::CacheStats,
    datastore::StoreStats,
    services::{LastBuild, SchedulerError},
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::time::Instant;

pub(super) fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/cache", get(cache_health))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/warmup", post(cache_warmup))
        .route("/build", post(build))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Check {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Check {
    fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn warn(message: impl ToString) -> Self {
        Self {
            status: "warn",
            message: Some(message.to_string()),
        }
    }

    fn failed(message: Option<String>) -> Self {
        Self {
            status: "failed",
            message,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Checks {
    datastore: Check,
    cache: Check,
    scheduler: Check,
    tree_builder: Check,
    file_system: Check,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    checks: Checks,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_build: Option<LastBuild>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datastore_stats: Option<StoreStats>,
    cache: CacheStats,
    response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_rss_bytes: Option<u64>,
}

/// Aggregate health: 200 when every required check passes, 503
/// otherwise. The cache is an accelerator, so it can only ever warn.
async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();

    let connection = state.core.store().test_connection().await;
    let datastore_stats = state.core.store().stats().await.ok();
    let cache = state.core.cache().stats().await;
    let scheduler = state.scheduler.status().await;
    let last_build = state.core.last_build().await;
    let fs_accessible = tokio::fs::metadata(state.core.source_dir()).await.is_ok();

    let builder_ok = last_build.as_ref().map_or(true, |b| b.success);
    let healthy = connection.connected && scheduler.healthy && fs_accessible && builder_ok;

    let checks = Checks {
        datastore: if connection.connected {
            Check::ok()
        } else {
            Check::failed(connection.error.clone())
        },
        cache: if !cache.enabled {
            Check::warn("cache tier is disabled")
        } else if cache.connected {
            Check::ok()
        } else {
            Check::warn("cache is unreachable; running in degraded mode")
        },
        scheduler: if scheduler.healthy {
            Check::ok()
        } else {
            Check::failed(Some("scheduler is not running or has stalled".to_string()))
        },
        tree_builder: match &last_build {
            None => Check::warn("no build has completed yet"),
            Some(build) if build.success => Check::ok(),
            Some(build) => Check::failed(build.error.clone()),
        },
        file_system: if fs_accessible {
            Check::ok()
        } else {
            Check::failed(Some(format!(
                "source directory `{}` is not accessible",
                state.core.source_dir().display()
            )))
        },
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        checks,
        last_build,
        datastore_stats,
        cache,
        response_time_ms: started.elapsed().as_millis() as u64,
        memory_rss_bytes: memory_rss_bytes(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Detailed status: every collaborator plus the most recent roots.
async fn status(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scheduler = state.scheduler.status().await;
    let last_build = state.core.last_build().await;
    let connection = state.core.store().test_connection().await;
    let stats = state.core.store().stats().await.ok();
    let cache = state.core.cache().stats().await;
    let recent = state
        .core
        .store()
        .recent_roots(5)
        .await
        .map_err(|e| ApiError::internal(state.environment, e))?;

    Ok(Json(json!({
        "scheduler": scheduler,
        "builder": { "lastBuild": last_build },
        "datastore": {
            "kind": state.core.store().kind(),
            "connection": connection,
            "stats": stats,
        },
        "cache": cache,
        "recentRoots": recent,
    })))
}

async fn cache_health(State(state): State<ApiState>) -> Json<CacheStats> {
    Json(state.core.cache().stats().await)
}

async fn cache_clear(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let cleared = state.core.cache().invalidate("merkle:*").await;
    tracing::info!(cleared, "cache cleared");
    Json(json!({ "cleared": cleared }))
}

/// Preloads the latest root and the metadata of recent roots so the
/// first reads after a cold start are served from the cache.
async fn cache_warmup(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.core.store();
    let cache = state.core.cache();
    let mut warmed = 0u64;

    let latest = store
        .latest_root_hash()
        .await
        .map_err(|e| ApiError::internal(state.environment, e))?;
    if let Some(latest) = latest {
        if cache.set_latest_root(&latest).await {
            warmed += 1;
        }
    }

    let recent = store
        .recent_roots(5)
        .await
        .map_err(|e| ApiError::internal(state.environment, e))?;
    for record in recent {
        if cache.set_tree_metadata(&record.root_hash, &record).await {
            warmed += 1;
        }
    }

    Ok(Json(json!({ "warmed": warmed })))
}

/// Manual build trigger: takes the scheduler's single-flight guard and
/// fails fast when a build is already running.
async fn build(State(state): State<ApiState>) -> Result<Json<LastBuild>, ApiError> {
    match state.scheduler.trigger().await {
        Ok(build) => Ok(Json(build)),
        Err(SchedulerError::Busy) => Err(ApiError::busy()),
        Err(SchedulerError::Service(e)) => Err(ApiError::internal(state.environment, e)),
    }
}

#[cfg(target_os = "linux")]
fn memory_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn memory_rss_bytes() -> Option<u64> {
    None
}
