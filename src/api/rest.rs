// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Small ops surface under `/api/v1/`. Health is public; everything else
// requires the Bearer token. Toggle writes go through the bus KV so the
// API and any other operator tooling are equivalent writers — the engine
// itself only ever reads the store.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::bus::{keys, MessageBus};
use crate::toggles::{self, parse_flag};
use crate::types::TradeMode;

/// Shared state for the API handlers: the app snapshot plus a bus handle
/// for toggle reads/writes.
pub struct ApiContext {
    pub app: Arc<AppState>,
    pub bus: Arc<dyn MessageBus>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(ctx: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/toggles", get(get_toggles))
        .route("/api/v1/toggles", post(set_toggles))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "state_version": ctx.app.current_state_version(),
        "uptime_secs": ctx.app.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    });
    Json(body)
}

// =============================================================================
// State & trades (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.app.build_snapshot())
}

async fn trades(_auth: AuthBearer, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.app.recent_trades.read().clone())
}

// =============================================================================
// Toggles (authenticated)
// =============================================================================

async fn get_toggles(_auth: AuthBearer, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    // Read the live store values; fall back to the engine's cache when the
    // bus is unreachable so the endpoint stays useful.
    let auto_trade = match ctx.bus.kv_get(keys::TOGGLE_AUTO_TRADE).await {
        Ok(Some(raw)) => parse_flag(&raw).unwrap_or(ctx.app.toggles.auto_trade()),
        _ => ctx.app.toggles.auto_trade(),
    };
    let mode = match ctx.bus.kv_get(keys::TOGGLE_MODE).await {
        Ok(Some(raw)) => TradeMode::parse(&raw).unwrap_or(ctx.app.toggles.mode()),
        _ => ctx.app.toggles.mode(),
    };

    Json(serde_json::json!({
        "autoTrade": auto_trade,
        "mode": mode.as_str(),
    }))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    #[serde(rename = "autoTrade")]
    auto_trade: Option<String>,
    mode: Option<String>,
}

async fn set_toggles(
    _auth: AuthBearer,
    State(ctx): State<Arc<ApiContext>>,
    Json(req): Json<ToggleRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mut applied = serde_json::Map::new();

    if let Some(raw) = &req.auto_trade {
        let Some(value) = parse_flag(raw) else {
            return Err(bad_request("autoTrade must be true/false (or 1/0, yes/no, on/off)"));
        };
        if let Err(e) = toggles::write_auto_trade(ctx.bus.as_ref(), value).await {
            warn!(error = %e, "autoTrade write failed");
            return Err(bad_gateway("toggle store write failed"));
        }
        info!(auto_trade = value, "autoTrade changed via API");
        applied.insert("autoTrade".to_string(), serde_json::Value::Bool(value));
    }

    if let Some(raw) = &req.mode {
        let Some(mode) = TradeMode::parse(raw) else {
            return Err(bad_request("mode must be 'paper' or 'live'"));
        };
        if let Err(e) = toggles::write_mode(ctx.bus.as_ref(), mode).await {
            warn!(error = %e, "mode write failed");
            return Err(bad_gateway("toggle store write failed"));
        }
        info!(mode = %mode, "mode changed via API");
        applied.insert(
            "mode".to_string(),
            serde_json::Value::String(mode.as_str().to_string()),
        );
    }

    if applied.is_empty() {
        return Err(bad_request("nothing to change: provide autoTrade and/or mode"));
    }

    ctx.app.increment_version();
    Ok(Json(serde_json::Value::Object(applied)))
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

fn bad_gateway(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": message })),
    )
}
