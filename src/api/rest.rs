// =============================================================================
// REST API Endpoints
// =============================================================================
//
// The tool-invocation surface plus operational introspection:
//
//   GET  /api/v1/health       public liveness probe
//   GET  /api/v1/state        full gateway state snapshot
//   GET  /api/v1/tools        tool registry
//   POST /api/v1/tools/call   { tool_name, parameters } -> envelope
//
// Every tool response is returned with HTTP 200; the envelope's `success`
// boolean is the contract. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::tools::{self, ToolCallRequest, TOOLS};

/// Build the full router with CORS middleware and shared state.
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
        .route("/api/v1/tools", get(list_tools))
        .route("/api/v1/tools/call", post(call_tool))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connected: bool,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        connected: state.session.is_connected(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// State snapshot (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Tool registry (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ToolInfo {
    name: &'static str,
    description: &'static str,
}

async fn list_tools(_auth: AuthBearer) -> impl IntoResponse {
    let tools: Vec<ToolInfo> = TOOLS
        .iter()
        .map(|&(name, description)| ToolInfo { name, description })
        .collect();
    Json(serde_json::json!({ "tools": tools }))
}

// =============================================================================
// Tool invocation (authenticated)
// =============================================================================

async fn call_tool(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToolCallRequest>,
) -> impl IntoResponse {
    let response = tools::dispatch(&state, &request.tool_name, request.parameters).await;
    Json(response)
}
