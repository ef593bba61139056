//! HTTP ingestion endpoint (requires the `http` feature).
//!
//! | Route | Response |
//! |-------|----------|
//! | `POST /v1/events` single event | 200 `{"status":"accepted"\|"duplicate","fingerprint":..}`, 422 if malformed |
//! | `POST /v1/events` `{"events":[..]}` | 200 batch report |
//! | `GET /health` | 200 `{"status":"ok"}` |
//! | `GET /v1/stats` | 200 coordinator counters |
//!
//! Store failures map to 503, anything else to 500. Deduplication calls block,
//! so handlers run them on the blocking pool.

use super::service::{EventStatus, IngestService};
use crate::Error;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Largest accepted request body.
pub const MAX_REQUEST_BODY_SIZE: usize = 8 * 1024 * 1024;

struct HttpState {
    ingest: IngestService,
}

/// Builds the ingestion router.
pub fn router(ingest: IngestService) -> Router {
    let state = Arc::new(HttpState { ingest });
    Router::new()
        .route("/v1/events", post(post_events))
        .route("/v1/stats", get(get_stats))
        .route("/health", get(health))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the router until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the address cannot be bound or the
/// server fails.
pub async fn serve(
    addr: SocketAddr,
    ingest: IngestService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::failed("bind", format!("{addr}: {e}")))?;
    tracing::info!(%addr, "Ingestion endpoint listening");
    axum::serve(listener, router(ingest))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::failed("serve", e))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn get_stats(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!(state.ingest.deduplicator().stats()))
}

async fn post_events(State(state): State<Arc<HttpState>>, body: Bytes) -> impl IntoResponse {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "status": "rejected", "error": format!("invalid JSON: {e}") })),
            );
        },
    };

    let ingest = state.ingest.clone();
    match value {
        Value::Object(mut object) if object.get("events").is_some_and(Value::is_array) => {
            let Some(Value::Array(events)) = object.remove("events") else {
                return internal("events array vanished");
            };
            let outcome = tokio::task::spawn_blocking(move || ingest.process(events)).await;
            match outcome {
                Ok(Ok(report)) => (StatusCode::OK, Json(json!(report))),
                Ok(Err(e)) => error_response(&e),
                Err(e) => internal(&e.to_string()),
            }
        },
        value => {
            let outcome = tokio::task::spawn_blocking(move || ingest.process_one(0, value)).await;
            match outcome {
                Ok(Ok(result)) if result.status == EventStatus::Rejected => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "status": result.status, "error": result.error })),
                ),
                Ok(Ok(result)) => (
                    StatusCode::OK,
                    Json(json!({ "status": result.status, "fingerprint": result.fingerprint })),
                ),
                Ok(Err(e)) => error_response(&e),
                Err(e) => internal(&e.to_string()),
            }
        },
    }
}

fn error_response(error: &Error) -> (StatusCode, Json<Value>) {
    let status = if error.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    tracing::warn!(status = status.as_u16(), error = %error, "Ingestion request failed");
    (
        status,
        Json(json!({ "status": "error", "error": error.to_string(), "retryable": error.is_retryable() })),
    )
}

fn internal(cause: &str) -> (StatusCode, Json<Value>) {
    tracing::error!(cause, "Ingestion handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "error": cause })),
    )
}
