use crate::config::BridgeConfig;
use crate::logging::SharedLogger;
use crate::orchestrator::{ChatRequest, ModelUpdate, Orchestrator};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_LOG_LIMIT: usize = 100;

pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub orchestrator: Orchestrator<BridgeConfig>,
    pub logger: SharedLogger,
}

/// Body of `POST /v1/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub models: Vec<String>,
    #[serde(flatten)]
    pub request: ChatRequest,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/stream", post(handle_stream))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .route("/v1/logs", get(handle_logs))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({
        "type": "error",
        "error": { "message": message.into() }
    });
    (status, Json(body)).into_response()
}

async fn handle_stream(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: StreamRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("Failed to parse request: {e}"));
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request body: {e}"));
        }
    };

    if req.models.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "At least one model is required");
    }

    state.logger.info(
        "server",
        format!(
            "Request: models={} messages={}",
            req.models.join(","),
            req.request.messages.len()
        ),
    );

    // Dropping the response body (client gone) cancels every model stream.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let updates = state
        .orchestrator
        .stream_many(&req.models, req.request, cancel);

    let events = updates.map(move |update| -> std::result::Result<Event, Infallible> {
        let _ = &guard;
        Ok(to_event(&update))
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn to_event(update: &ModelUpdate) -> Event {
    let data = serde_json::to_string(update).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(update.event.name()).data(data)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .config
        .models
        .iter()
        .map(|(key, entry)| match entry.resolve(key) {
            Ok(target) => serde_json::json!({
                "id": key,
                "model": target.model,
                "protocol": target.protocol,
                "ready": true,
            }),
            Err(e) => serde_json::json!({
                "id": key,
                "ready": false,
                "error": e.to_string(),
            }),
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let entries = state.logger.recent(query.limit.unwrap_or(DEFAULT_LOG_LIMIT));
    Json(serde_json::json!({ "data": entries }))
}
