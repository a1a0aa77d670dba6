//! HTTP tool server.
//!
//! Exposes the tool surface over JSON HTTP for AI-tool integration. Every
//! response body is the audit envelope itself — callers always get
//! `inputs_hash`/`outputs_hash`, `provenance`, `warnings`, and `errors`
//! regardless of outcome, so transport status codes carry no semantics
//! beyond routing failures.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/{name}` | Invoke a tool; body is the input record |
//! | `GET`  | `/tools` | List available tool names |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients and cross-origin tool calls.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::envelope::Envelope;
use crate::tools::{run_tool, ToolContext, TOOL_NAMES};

/// Start the tool server on the configured bind address.
///
/// Runs until the process terminates; returns an error if binding fails.
pub async fn run_server(ctx: ToolContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/:name", post(handle_tool))
        .route("/tools", get(handle_list_tools))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(ctx);

    info!("tool server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Handler for `POST /tools/{name}`.
///
/// Unknown tools and validation failures still produce an envelope, with
/// the failure carried in `errors[]`.
async fn handle_tool(
    State(ctx): State<ToolContext>,
    Path(name): Path<String>,
    Json(input): Json<Value>,
) -> Json<Envelope> {
    Json(run_tool(&ctx, &name, input).await)
}

/// JSON response body for `GET /tools`.
#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<&'static str>,
}

async fn handle_list_tools() -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: TOOL_NAMES.to_vec(),
    })
}

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
