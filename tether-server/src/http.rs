//! Tether HTTP REST API
//!
//! Axum-based HTTP server exposing connection management.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a pure
//! inner function returning `(StatusCode, serde_json::Value)`. The inner
//! functions are directly testable without axum dispatch machinery.
//!
//! Endpoints:
//! - GET    /health                     health check with storage status
//! - GET    /version                    server version info
//! - POST   /connections                create a connection, returns its QR
//! - GET    /connections?owner_id=      list an owner's connections
//! - GET    /connections/:id            connection status
//! - DELETE /connections/:id            disconnect the live session
//! - DELETE /connections/:id/record     delete the connection entirely
//! - POST   /connections/:id/restore    restore one connection
//! - POST   /connections/:id/messages   send a message
//! - POST   /admin/restore              restore every ready connection
//! - POST   /admin/sweep                run a cleanup sweep now

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tether_core::{MessageContent, TetherConfig, TetherError};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::service::ConnectionService;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<ConnectionService>,
    /// Present when the store is Postgres; used by `/health`.
    pub pool: Option<PgPool>,
    pub config: TetherConfig,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/connections", post(add_handler).get(list_handler))
        .route("/connections/:id", get(status_handler).delete(disconnect_handler))
        .route("/connections/:id/record", delete(delete_handler))
        .route("/connections/:id/restore", post(restore_handler))
        .route("/connections/:id/messages", post(send_handler))
        .route("/admin/restore", post(restore_all_handler))
        .route("/admin/sweep", post(sweep_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Tether HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct AddConnectionRequest {
    pub owner_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub owner_id: Option<String>,
}

/// `content` may be a plain string (text message) or a tagged
/// `MessageContent` object.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub to: Option<String>,
    pub content: Option<ContentField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContentField {
    Text(String),
    Structured(MessageContent),
}

impl ContentField {
    pub fn into_content(self) -> MessageContent {
        match self {
            ContentField::Text(body) => MessageContent::text(body),
            ContentField::Structured(content) => content,
        }
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: storage status plus active session count.
pub async fn health_inner(
    service: &ConnectionService,
    pool: Option<&PgPool>,
) -> (StatusCode, serde_json::Value) {
    let storage = match pool {
        Some(pool) => match tether_core::db::health_check(pool).await {
            Ok(version) => version,
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "status": "unhealthy",
                        "error": e.to_string(),
                    }),
                );
            }
        },
        None => service.store_name().to_string(),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "storage": storage,
            "active_sessions": service.registry().len(),
        }),
    )
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "tether/1",
    })
}

pub async fn add_inner(
    service: &ConnectionService,
    req: AddConnectionRequest,
) -> (StatusCode, serde_json::Value) {
    let owner_id = match req.owner_id {
        Some(owner) if !owner.trim().is_empty() => owner,
        _ => return validation_error("owner_id field is required"),
    };

    match service.add_connection(&owner_id).await {
        Ok(added) => (StatusCode::CREATED, ok_body("connection", &added)),
        Err(e) => error_response(&e),
    }
}

pub async fn list_inner(
    service: &ConnectionService,
    query: ListQuery,
) -> (StatusCode, serde_json::Value) {
    let owner_id = match query.owner_id {
        Some(owner) if !owner.trim().is_empty() => owner,
        _ => return validation_error("owner_id query parameter is required"),
    };

    match service.list_connections(&owner_id).await {
        Ok(connections) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "count": connections.len(),
                "connections": connections,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn status_inner(service: &ConnectionService, id: &str) -> (StatusCode, serde_json::Value) {
    match service.get_status(id).await {
        Ok(view) => (StatusCode::OK, ok_body("connection", &view)),
        Err(e) => error_response(&e),
    }
}

pub async fn disconnect_inner(service: &ConnectionService, id: &str) -> (StatusCode, serde_json::Value) {
    match service.disconnect(id).await {
        Ok(()) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "connection_id": id,
                "disconnected": true,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_inner(service: &ConnectionService, id: &str) -> (StatusCode, serde_json::Value) {
    match service.delete_connection(id).await {
        Ok(()) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "connection_id": id,
                "deleted": true,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn restore_inner(service: &ConnectionService, id: &str) -> (StatusCode, serde_json::Value) {
    let result = service.restore(id).await;
    let status = match (result.success, result.code.as_deref()) {
        (true, _) => StatusCode::OK,
        (false, Some("not_found")) => StatusCode::NOT_FOUND,
        (false, Some("validation")) => StatusCode::BAD_REQUEST,
        (false, Some("already_active")) | (false, Some("needs_reauth")) => StatusCode::CONFLICT,
        (false, Some("session_init")) => StatusCode::BAD_GATEWAY,
        (false, _) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::to_value(&result).unwrap_or_else(|_| serde_json::json!({}));
    (status, body)
}

pub async fn send_inner(
    service: &ConnectionService,
    id: &str,
    req: SendMessageRequest,
) -> (StatusCode, serde_json::Value) {
    let to = match req.to {
        Some(to) if !to.trim().is_empty() => to,
        _ => return validation_error("to field is required"),
    };
    let content = match req.content {
        Some(content) => content.into_content(),
        None => return validation_error("content field is required"),
    };

    match service.send_message(id, &to, &content).await {
        Ok(ack) => (StatusCode::OK, ok_body("message", &ack)),
        Err(e) => error_response(&e),
    }
}

pub async fn restore_all_inner(service: &ConnectionService) -> (StatusCode, serde_json::Value) {
    match service.restore_all().await {
        Ok(report) => (StatusCode::OK, ok_body("report", &report)),
        Err(e) => error_response(&e),
    }
}

pub async fn sweep_inner(service: &ConnectionService) -> (StatusCode, serde_json::Value) {
    match service.sweep().await {
        Ok(report) => (StatusCode::OK, ok_body("report", &report)),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.service, state.pool.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn add_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<AddConnectionRequest>,
) -> impl IntoResponse {
    let (status, body) = add_inner(&state.service, req).await;
    (status, Json(body))
}

pub async fn list_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let (status, body) = list_inner(&state.service, query).await;
    (status, Json(body))
}

pub async fn status_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = status_inner(&state.service, &id).await;
    (status, Json(body))
}

pub async fn disconnect_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = disconnect_inner(&state.service, &id).await;
    (status, Json(body))
}

pub async fn delete_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = delete_inner(&state.service, &id).await;
    (status, Json(body))
}

pub async fn restore_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = restore_inner(&state.service, &id).await;
    (status, Json(body))
}

pub async fn send_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    let (status, body) = send_inner(&state.service, &id, req).await;
    (status, Json(body))
}

pub async fn restore_all_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = restore_all_inner(&state.service).await;
    (status, Json(body))
}

pub async fn sweep_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = sweep_inner(&state.service).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

/// HTTP status for a service error.
pub fn status_for(error: &TetherError) -> StatusCode {
    match error {
        TetherError::Validation(_) => StatusCode::BAD_REQUEST,
        TetherError::NotFound(_) => StatusCode::NOT_FOUND,
        TetherError::NotReady { .. } | TetherError::AlreadyActive(_) => StatusCode::CONFLICT,
        TetherError::SessionInit { .. } | TetherError::Delivery { .. } => StatusCode::BAD_GATEWAY,
        TetherError::Persistence(tether_core::StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Standard error body: `{status: "error", code, error}`.
pub fn error_response(error: &TetherError) -> (StatusCode, serde_json::Value) {
    let status = status_for(error);
    if status.is_server_error() {
        tracing::warn!(code = error.code(), error = %error, "Request failed");
    }
    (
        status,
        serde_json::json!({
            "status": "error",
            "code": error.code(),
            "error": error.to_string(),
        }),
    )
}

fn validation_error(message: &str) -> (StatusCode, serde_json::Value) {
    error_response(&TetherError::Validation(message.to_string()))
}

/// `{status: "ok", <key>: value}`
fn ok_body<T: serde::Serialize>(key: &str, value: &T) -> serde_json::Value {
    let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let mut body = serde_json::Map::new();
    body.insert("status".to_string(), serde_json::json!("ok"));
    body.insert(key.to_string(), value);
    serde_json::Value::Object(body)
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ConnectionStatus;

    // ========================================================================
    // TEST 1: version_inner is pure and returns correct fields
    // ========================================================================
    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["protocol"], "tether/1", "protocol must be tether/1");
    }

    // ========================================================================
    // TEST 2: error mapping follows the error taxonomy
    // ========================================================================
    #[test]
    fn test_status_for_error_taxonomy() {
        assert_eq!(status_for(&TetherError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&TetherError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&TetherError::AlreadyActive("c1".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&TetherError::NotReady {
                connection_id: "c1".into(),
                status: ConnectionStatus::WaitingConnection,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&TetherError::session_init("c1", "boom")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&TetherError::Persistence(tether_core::StoreError::Corrupt("x".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    // ========================================================================
    // TEST 3: error body carries status, code and message
    // ========================================================================
    #[test]
    fn test_error_response_body() {
        let (status, body) = error_response(&TetherError::NotFound("connection c9".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "not_found");
        assert!(body["error"].as_str().unwrap().contains("c9"));
    }

    // ========================================================================
    // TEST 4: content accepts a bare string or a tagged object
    // ========================================================================
    #[test]
    fn test_send_request_content_forms() {
        let text: SendMessageRequest =
            serde_json::from_value(serde_json::json!({"to": "1", "content": "hi"})).unwrap();
        assert_eq!(text.content.unwrap().into_content(), MessageContent::text("hi"));

        let media: SendMessageRequest = serde_json::from_value(serde_json::json!({
            "to": "1",
            "content": {"type": "media", "mime_type": "image/png", "data": "aGk=", "filename": null, "caption": "pic"}
        }))
        .unwrap();
        assert!(matches!(
            media.content.unwrap().into_content(),
            MessageContent::Media { .. }
        ));
    }

    // ========================================================================
    // TEST 5: ok_body nests the payload next to the status tag
    // ========================================================================
    #[test]
    fn test_ok_body_nests_payload() {
        let body = ok_body("report", &serde_json::json!({"status": "ready", "count": 2}));
        assert_eq!(body["status"], "ok");
        assert_eq!(body["report"]["status"], "ready");
        assert_eq!(body["report"]["count"], 2);
    }
}
