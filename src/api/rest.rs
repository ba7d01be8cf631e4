// =============================================================================
// REST endpoints — axum 0.7
// =============================================================================
//
// All routes live under `/api/v1/`. The health check is public; everything
// else requires the bearer token. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::config_store::KEY_TRADING_ENABLED;

/// Build the full router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/circuit-breaker/status", get(circuit_breaker_status))
        .route("/api/v1/analyze/:market", post(analyze_market))
        .route("/api/v1/config", get(list_config).put(put_config))
        .route("/api/v1/config/:key", get(get_config_key))
        .route("/api/v1/lifecycle", get(lifecycle_window))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Status
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status_snapshot().await)
}

// =============================================================================
// Circuit breaker
// =============================================================================

async fn circuit_breaker_status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let (markets, global) = state.breaker.status();
    Json(serde_json::json!({
        "markets": markets,
        "global": global,
    }))
}

// =============================================================================
// Manual analysis trigger
// =============================================================================

async fn analyze_market(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(market): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.analyze_market(&market).await {
        Ok(signal) => {
            info!(market = %market, action = %signal.action, "manual analysis triggered");
            Ok(Json(signal))
        }
        Err(e) => {
            warn!(market = %market, error = %e, "manual analysis failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Deserialize)]
struct ConfigQuery {
    #[serde(default)]
    category: Option<String>,
}

async fn list_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConfigQuery>,
) -> impl IntoResponse {
    let entries = match query.category {
        Some(category) => state.config.list_by_category(&category),
        None => state.config.all(),
    };
    Json(entries)
}

async fn get_config_key(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state.config.entry(&key) {
        Some(entry) => Ok(Json(entry)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no such key: {key}") })),
        )),
    }
}

#[derive(Deserialize)]
struct ConfigWrite {
    key: String,
    value: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn put_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(write): Json<ConfigWrite>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    match state
        .config
        .set_with_meta(
            &write.key,
            &write.value,
            write.category.as_deref(),
            write.description.as_deref(),
        )
        .await
    {
        Ok(()) => {
            info!(key = %write.key, value = %write.value, "config updated via API");
            Ok(Json(serde_json::json!({ "key": write.key, "value": write.value })))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

// =============================================================================
// Lifecycle window
// =============================================================================

#[derive(Deserialize)]
struct LifecycleQuery {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
}

async fn lifecycle_window(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LifecycleQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let from = query.from.unwrap_or_else(|| state.clock.local_midnight_utc());
    let to = query.to.unwrap_or_else(Utc::now);

    let events = state
        .repos
        .lifecycle
        .events_between(from, to)
        .await
        .map_err(internal_error)?;
    let rollup = state
        .lifecycle
        .rollup_between(from, to)
        .await
        .map_err(internal_error)?;

    Ok(Json(serde_json::json!({
        "from": from,
        "to": to,
        "events": events,
        "rollup": rollup,
    })))
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

// =============================================================================
// Control
// =============================================================================

async fn control_pause(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    state
        .config
        .set(KEY_TRADING_ENABLED, "false")
        .await
        .map_err(internal_error)?;
    warn!("trading PAUSED via API");
    state
        .notifier
        .send_system("Trading paused", "paused by operator request")
        .await;
    Ok(Json(serde_json::json!({ "trading_enabled": false })))
}

async fn control_resume(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    state
        .config
        .set(KEY_TRADING_ENABLED, "true")
        .await
        .map_err(internal_error)?;
    info!("trading RESUMED via API");
    state
        .notifier
        .send_system("Trading resumed", "resumed by operator request")
        .await;
    Ok(Json(serde_json::json!({ "trading_enabled": true })))
}
