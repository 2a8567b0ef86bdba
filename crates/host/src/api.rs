//! REST API server for pagesync
//!
//! Provides HTTP endpoints for document management and automation. Live
//! editing goes over the WebSocket relay; these routes cover bootstrap,
//! inspection and local token minting.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use pagesync_protocol::{DiffEnvelope, ServerMessage};

use crate::auth;
use crate::hub::SyncHub;

// Shared state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SyncHub>,
    pub secret: Arc<String>,
    pub ws_port: u16,
}

// Document creation request: the synthetic version-0 envelope that seeds
// the diff log
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub document_id: String,
    pub created_by: String,
    #[serde(flatten)]
    pub envelope: DiffEnvelope,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub since: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub user_id: String,
    pub ttl_secs: Option<i64>,
}

// Routes
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/documents", post(create_document))
        .route("/documents/:id", get(get_document))
        .route("/documents/:id/history", get(get_history))
        .route("/tokens", post(mint_token))
}

// Handlers

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn create_document(
    State(state): State<AppState>,
    Json(payload): Json<CreateDocumentRequest>,
) -> impl IntoResponse {
    if payload.document_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "documentId is required" })),
        );
    }

    match state
        .hub
        .create_document(&payload.document_id, &payload.envelope, &payload.created_by)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "documentId": payload.document_id,
                "created": true,
                "wsPort": state.ws_port,
            })),
        ),
        Err(crate::ledger::LedgerError::AlreadyExists(id)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("document {id} already exists") })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn get_document(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.hub.document_data(&id).await {
        Ok(ServerMessage::DocData {
            document_id,
            version,
            content,
        }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "documentId": document_id,
                "version": version,
                "content": content,
            })),
        ),
        Ok(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "unexpected reply" })),
        ),
        Err(crate::ledger::LedgerError::UnknownDocument(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "document not found" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    // Existence check first so an empty slice is not mistaken for a
    // missing document
    if let Err(e) = state.hub.ledger().committed_version(&id).await {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        );
    }

    match state.hub.ledger().catch_up(&id, query.since).await {
        Ok(diffs) => (
            StatusCode::OK,
            Json(serde_json::json!({ "documentId": id, "diffs": diffs })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

/// Mint a sealed session token for local development and automation.
/// The HTTP server binds to localhost, so this is not reachable from
/// other machines in the default configuration.
async fn mint_token(
    State(state): State<AppState>,
    Json(payload): Json<TokenRequest>,
) -> impl IntoResponse {
    if payload.user_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "userId is required" })),
        );
    }

    let ttl = payload.ttl_secs.unwrap_or(3600).clamp(1, 86400);
    let now = chrono::Utc::now().timestamp();
    let token = auth::seal_token(&state.secret, &payload.user_id, now, ttl);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "token": token, "expiresAt": now + ttl })),
    )
}
