//! Rebecca HTTP API
//!
//! Axum server exposing authentication, chat history and the streaming chat
//! relay.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! taking plain values, so the request logic is testable without axum
//! dispatch.
//!
//! Endpoints:
//! - GET  /health             : health check with storage status
//! - GET  /version            : server version info
//! - POST /auth/register      : create a user
//! - POST /auth/login         : exchange credentials for a bearer token
//! - POST /chat               : stream a reply as Server-Sent Events
//! - GET  /chat/conversations : recent turns for the caller, oldest first

use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rebecca_core::auth::{hash_password, verify_password};
use rebecca_core::{
    ChatBackend, ChatError, ChatService, ConversationStore, RebeccaConfig, RelayStream,
    SessionGate, StoreError, UserStore,
};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::sse::relay_sse;

pub const DEFAULT_HISTORY_PAGE: u32 = 10;
pub const MAX_HISTORY_PAGE: u32 = 100;
pub const MIN_PASSWORD_LEN: usize = 8;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub users: Arc<dyn UserStore>,
    pub turns: Arc<dyn ConversationStore>,
    pub gate: SessionGate,
    pub chat: ChatService,
    /// `None` when running on the in-memory store.
    pub pool: Option<PgPool>,
}

impl HttpState {
    pub fn new(
        config: &RebeccaConfig,
        users: Arc<dyn UserStore>,
        turns: Arc<dyn ConversationStore>,
        backend: Arc<dyn ChatBackend>,
        gate: SessionGate,
        pool: Option<PgPool>,
    ) -> Self {
        let chat = ChatService::from_parts(&config.chat, users.clone(), turns.clone(), backend);
        Self {
            users,
            turns,
            gate,
            chat,
            pool,
        }
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/chat", post(chat_handler))
        .route("/chat/conversations", get(conversations_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: HttpState,
    config: &RebeccaConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Rebecca HTTP API listening on http://{}", addr);

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

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_input: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

type HttpError = (StatusCode, serde_json::Value);

fn error_body(status: StatusCode, msg: impl Into<String>) -> HttpError {
    (status, serde_json::json!({ "error": msg.into() }))
}

/// Status code for an error raised before streaming starts.
pub fn chat_error_status(err: &ChatError) -> StatusCode {
    match err {
        ChatError::Unauthenticated | ChatError::TokenExpired | ChatError::TokenInvalid => {
            StatusCode::UNAUTHORIZED
        }
        ChatError::UserNotFound => StatusCode::NOT_FOUND,
        ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ChatError::BackendUnavailable(_) | ChatError::StreamInterrupted(_) => {
            StatusCode::BAD_GATEWAY
        }
        ChatError::StorageFailure(_) | ChatError::StorageUnavailable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn chat_error_body(err: &ChatError) -> HttpError {
    error_body(chat_error_status(err), err.to_string())
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: returns (status_code, json_body).
pub async fn health_inner(pool: Option<&PgPool>) -> (StatusCode, serde_json::Value) {
    let Some(pool) = pool else {
        return (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "storage": "memory",
            }),
        );
    };

    match rebecca_core::db::health_check(pool).await {
        Ok(pg_ver) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "storage": "postgresql",
                "postgresql": pg_ver,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "rebecca/1",
    })
}

fn validated_credentials(req: CredentialsRequest) -> Result<(String, String), HttpError> {
    let username = req.username.map(|u| u.trim().to_string()).unwrap_or_default();
    let password = req.password.unwrap_or_default();
    if username.is_empty() || password.is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "username and password are required",
        ));
    }
    Ok((username, password))
}

/// Inner register: hashes the password and creates the user.
pub async fn register_inner(state: &HttpState, req: CredentialsRequest) -> HttpError {
    let (username, password) = match validated_credentials(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if password.chars().count() < MIN_PASSWORD_LEN {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("password must be at least {} characters", MIN_PASSWORD_LEN),
        );
    }

    let hashed = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    match state.users.create_user(&username, &hashed).await {
        Ok(user) => {
            tracing::info!(user_id = user.id, username = %user.username, "Registered user");
            (
                StatusCode::CREATED,
                serde_json::json!({ "id": user.id, "username": user.username }),
            )
        }
        Err(StoreError::Conflict(msg)) => error_body(StatusCode::CONFLICT, msg),
        Err(e) => {
            tracing::error!(error = %e, "Registration failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Inner login: verifies credentials and issues a bearer token.
pub async fn login_inner(state: &HttpState, req: CredentialsRequest) -> HttpError {
    let (username, password) = match validated_credentials(req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let user = match state.users.find_by_username(&username).await {
        Ok(u) => u,
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let Some(user) = user else {
        return error_body(StatusCode::UNAUTHORIZED, "Invalid username or password");
    };

    let stored = user.password_hash.clone();
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .unwrap_or(false);
    if !verified {
        tracing::warn!(username = %username, "Rejected login");
        return error_body(StatusCode::UNAUTHORIZED, "Invalid username or password");
    }

    (
        StatusCode::OK,
        serde_json::json!({
            "token": state.gate.issue(user.id),
            "token_type": "Bearer",
            "expires_in": state.gate.ttl_seconds(),
        }),
    )
}

/// Inner conversations: resolves the caller and lists recent turns oldest first.
pub async fn conversations_inner(
    state: &HttpState,
    authorization: Option<&str>,
    query: HistoryQuery,
) -> HttpError {
    let user_id = match state.gate.resolve_bearer(authorization) {
        Ok(id) => id,
        Err(e) => return chat_error_body(&e),
    };

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .clamp(1, MAX_HISTORY_PAGE);

    match state.turns.fetch_recent(user_id, limit).await {
        Ok(mut turns) => {
            turns.reverse();
            let count = turns.len();
            (
                StatusCode::OK,
                serde_json::json!({ "conversations": turns, "count": count }),
            )
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Inner chat: gate, validate, assemble and start the relay. Any error here
/// happens before a single byte of the stream is sent.
pub async fn chat_inner(
    state: &HttpState,
    authorization: Option<&str>,
    body: Result<ChatRequest, String>,
) -> Result<RelayStream, HttpError> {
    let user_id = state.gate.resolve_bearer(authorization).map_err(|e| {
        tracing::debug!(kind = e.kind(), "Rejected chat request at session gate");
        chat_error_body(&e)
    })?;

    let req = body.map_err(|msg| error_body(StatusCode::BAD_REQUEST, msg))?;

    state
        .chat
        .start(user_id, &req.user_input)
        .await
        .map_err(|e| {
            tracing::warn!(user_id, kind = e.kind(), error = %e, "Chat request failed before streaming");
            chat_error_body(&e)
        })
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.pool.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

/// Malformed JSON bodies get the same `{"error": ...}` shape as every other failure.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    body.map(|Json(req)| req)
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, e.body_text()))
}

pub async fn register_handler(
    State(state): State<Arc<HttpState>>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match json_body(body) {
        Ok(req) => register_inner(&state, req).await,
        Err(e) => e,
    };
    (status, Json(body))
}

pub async fn login_handler(
    State(state): State<Arc<HttpState>>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = match json_body(body) {
        Ok(req) => login_inner(&state, req).await,
        Err(e) => e,
    };
    (status, Json(body))
}

pub async fn conversations_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let (status, body) = conversations_inner(&state, authorization(&headers), query).await;
    (status, Json(body))
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let body = body.map(|Json(req)| req).map_err(|e| e.body_text());
    match chat_inner(&state, authorization(&headers), body).await {
        Ok(events) => relay_sse(events).into_response(),
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
