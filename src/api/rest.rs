// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// The operational surface is deliberately small: one generic `/execute`
// endpoint routes every entity operation through the dispatch boundary, the
// runner trigger fires a worker pass on demand, and the config pair
// reads/patches the runtime tunables.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::dispatch::{self, DispatchError, ExecContext};
use crate::scheduler::{self, WorkerKind};
use crate::types::EngineMode;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/execute", post(execute))
        .route("/api/v1/runners/:name/trigger", post(trigger_runner))
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/config", post(set_config))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot (authenticated)
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let snapshot = state.build_snapshot();
    Json(snapshot)
}

// =============================================================================
// Execute (authenticated) — generic entity-operation dispatch
// =============================================================================

#[derive(Deserialize)]
struct ExecuteRequest {
    operation: String,
    #[serde(default)]
    payload: Value,
    org_id: String,
    agent_id: String,
}

fn error_response(state: &Arc<AppState>, err: DispatchError) -> axum::response::Response {
    let DispatchError { error, details } = err;
    state.push_error(error.to_string(), Some(error.code().to_string()));
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error.to_body(details))).into_response()
}

async fn execute(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let ctx = ExecContext { org_id: req.org_id, agent_id: req.agent_id };
    match dispatch::execute(&state, &req.operation, req.payload, &ctx).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(&state, err),
    }
}

// =============================================================================
// Runner trigger (authenticated)
// =============================================================================

async fn trigger_runner(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(kind) = WorkerKind::parse(&name) else {
        let body = serde_json::json!({
            "code": "NOT_FOUND",
            "message": format!("unknown runner '{name}'"),
        });
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    };

    info!(runner = kind.name(), "manual runner trigger");
    let report = scheduler::run_worker(&state, kind).await;
    Json(serde_json::json!({ "runner": kind.name(), "report": report })).into_response()
}

// =============================================================================
// Runtime config (authenticated)
// =============================================================================

async fn get_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let config = state.runtime_config.read().clone();
    Json(config)
}

/// Partial update: only the fields present in the body change.
#[derive(Deserialize)]
struct ConfigUpdate {
    engine_mode: Option<EngineMode>,
    predictor_ttl_hours: Option<i64>,
    dedup_lookback_hours: Option<i64>,
    resolution_horizon_hours: Option<i64>,
    review_confidence_low: Option<f64>,
    review_confidence_high: Option<f64>,
    neutral_band_pct: Option<f64>,
    evaluation_window_days: Option<i64>,
    missed_min_move_pct: Option<f64>,
    source_failure_limit: Option<u32>,
    external_timeout_secs: Option<u64>,
}

async fn set_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    // Apply the update to a candidate copy first; the shared config is only
    // replaced once the merged values validate. A rejected update leaves the
    // running config untouched.
    let mut candidate = state.runtime_config.read().clone();
    let mut changes = Vec::new();

    macro_rules! apply {
        ($field:ident) => {
            if let Some(val) = update.$field {
                if candidate.$field != val {
                    changes.push(format!(
                        "{}: {:?} -> {:?}",
                        stringify!($field),
                        candidate.$field,
                        val
                    ));
                    candidate.$field = val;
                }
            }
        };
    }

    apply!(engine_mode);
    apply!(predictor_ttl_hours);
    apply!(dedup_lookback_hours);
    apply!(resolution_horizon_hours);
    apply!(review_confidence_low);
    apply!(review_confidence_high);
    apply!(neutral_band_pct);
    apply!(evaluation_window_days);
    apply!(missed_min_move_pct);
    apply!(source_failure_limit);
    apply!(external_timeout_secs);

    // The gray zone must stay a valid interval.
    if candidate.review_confidence_low > candidate.review_confidence_high {
        let body = serde_json::json!({
            "code": "INVALID_CONFIG",
            "message": "review_confidence_low must not exceed review_confidence_high",
        });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    if !changes.is_empty() {
        *state.runtime_config.write() = candidate.clone();
        info!(changes = ?changes, "Runtime config updated");

        // Save to disk (best-effort).
        if let Err(e) = candidate.save("runtime_config.json") {
            warn!(error = %e, "Failed to save runtime config to disk");
        }

        state.increment_version();
    }

    let mut response = serde_json::to_value(&candidate).unwrap_or_default();
    if let Some(obj) = response.as_object_mut() {
        obj.insert(
            "changes".to_string(),
            serde_json::to_value(&changes).unwrap_or_default(),
        );
    }
    Json(response).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;

    fn empty_update() -> ConfigUpdate {
        ConfigUpdate {
            engine_mode: None,
            predictor_ttl_hours: None,
            dedup_lookback_hours: None,
            resolution_horizon_hours: None,
            review_confidence_low: None,
            review_confidence_high: None,
            neutral_band_pct: None,
            evaluation_window_days: None,
            missed_min_move_pct: None,
            source_failure_limit: None,
            external_timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn rejected_config_update_leaves_config_untouched() {
        let state = Arc::new(AppState::new(RuntimeConfig::default()));
        let before_low = state.runtime_config.read().review_confidence_low;
        let before_high = state.runtime_config.read().review_confidence_high;
        let before_version = state.current_state_version();

        // Inverted gray zone must be rejected without mutating anything.
        let update = ConfigUpdate {
            review_confidence_low: Some(0.9),
            review_confidence_high: Some(0.2),
            ..empty_update()
        };
        let resp = set_config(
            AuthBearer("token".into()),
            State(state.clone()),
            Json(update),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let config = state.runtime_config.read();
        assert_eq!(config.review_confidence_low, before_low);
        assert_eq!(config.review_confidence_high, before_high);
        drop(config);
        assert_eq!(state.current_state_version(), before_version);

        // The original gray zone still holds.
        assert!(state.runtime_config.read().in_review_gray_zone(0.55));
    }

    #[tokio::test]
    async fn unchanged_config_update_is_a_noop() {
        let state = Arc::new(AppState::new(RuntimeConfig::default()));
        let before_version = state.current_state_version();

        let update = ConfigUpdate {
            review_confidence_low: Some(state.runtime_config.read().review_confidence_low),
            ..empty_update()
        };
        let resp = set_config(
            AuthBearer("token".into()),
            State(state.clone()),
            Json(update),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.current_state_version(), before_version);
    }
}
