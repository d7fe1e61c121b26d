//! Management API
//!
//! HTTP surface for status, extension reload/restart, and targeted
//! hangups. Unauthenticated in the current scope.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use intercom_core::{CallId, TurnRole};
use intercom_transport::{write_frame, Frame};

use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/extensions", get(get_extensions))
        .route("/api/refresh", post(refresh))
        .route("/api/restart", post(restart))
        .route("/api/hangup", post(hangup))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Active sessions, listener pairs and system load
async fn get_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|session| {
            let roles: Vec<&str> = state
                .resources
                .connected_roles(&session.call_id)
                .into_iter()
                .map(|r| r.as_str())
                .collect();
            let port = state.resources.session_port(&session.call_id);
            let extension = port
                .and_then(|p| state.extensions.pair_for_port(p))
                .map(|pair| pair.id);
            serde_json::json!({
                "call_id": session.call_id.to_string(),
                "state": session.state().to_string(),
                "roles": roles,
                "port": port,
                "extension": extension,
                "age_seconds": session.age().as_secs(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "success",
        "total_sessions": sessions.len(),
        "sessions": sessions,
        "extensions": state.extensions.status(),
        "load": state.resources.sample_load(),
    }))
}

/// All directory entries, straight from the store
async fn get_extensions(State(state): State<AppState>) -> impl IntoResponse {
    match state.directory.list_extensions().await {
        Ok(extensions) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "total": extensions.len(),
                "extensions": extensions,
            })),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "status": "error",
                "message": err.to_string(),
            })),
        ),
    }
}

/// Reconcile listener pairs against the directory
async fn refresh(State(state): State<AppState>) -> impl IntoResponse {
    match state.extensions.refresh().await {
        Ok((removed, updated, added)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "stats": {
                    "removed": removed,
                    "updated": updated,
                    "added": added,
                    "total_active": state.extensions.active_pairs(),
                },
            })),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "status": "error",
                "message": err.to_string(),
            })),
        ),
    }
}

/// Restart one pair, addressed by id or extension number
async fn restart(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let id = if let Some(id) = body.get("extension_id").and_then(|v| v.as_i64()) {
        Some(id)
    } else if let Some(number) = body.get("ramal").and_then(|v| v.as_str()) {
        state.extensions.id_for_number(number)
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "message": "extension_id or ramal is required",
            })),
        );
    };

    let Some(id) = id else {
        return not_found("extension not found");
    };

    match state.extensions.restart(id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "message": format!("extension {id} restarted"),
            })),
        ),
        Ok(false) => not_found("extension not found"),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "status": "error",
                "message": err.to_string(),
            })),
        ),
    }
}

/// Write a HANGUP on one leg and wind the session down
async fn hangup(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(call_id) = body
        .get("call_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<CallId>().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "message": "call_id is required",
            })),
        );
    };

    let role = match body.get("role").and_then(|v| v.as_str()) {
        Some("visitor") => TurnRole::Visitor,
        Some("resident") => TurnRole::Resident,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "status": "error",
                    "message": "role must be visitor or resident",
                })),
            )
        }
    };

    if state.registry.get(&call_id).is_none() {
        return not_found("session not found");
    }
    let Some(writer) = state.resources.connection(&call_id, role) else {
        return not_found("no live connection for that leg");
    };

    {
        let mut w = writer.lock().await;
        if let Err(err) = write_frame(&mut *w, &Frame::Hangup).await {
            if err.is_expected_reset() {
                tracing::info!(%call_id, "peer reset during requested hangup");
            } else {
                tracing::warn!(%call_id, %err, "requested hangup failed");
            }
        }
    }

    // Same latches the state machine uses; whichever path completes first
    // schedules removal and the other becomes a no-op.
    state.registry.end(&call_id);

    let registry = state.registry.clone();
    let resources = state.resources.clone();
    let grace = state.config.system.cleanup_grace();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        registry.complete(&call_id);
        resources.unregister_session(&call_id);
    });

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "success",
            "message": format!("hangup sent to {} leg of {call_id}", role.as_str()),
        })),
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn not_found(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "status": "error",
            "message": message,
        })),
    )
}
