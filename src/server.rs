use crate::canonical::{CanonicalChatRequest, CanonicalCompletionRequest};
use crate::error::BrokerError;
use crate::proxy::{ErrorEnvelope, FrameStream, LlmProxy, ProxyFrame, ProxyOutcome, Rejection};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub proxy: LlmProxy,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/models", get(handle_model_aliases))
        .route("/v1/models", get(handle_models))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/completions", post(handle_completions))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let req: CanonicalChatRequest = match parse_body(&state, &body, started) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    tracing::info!(
        model = req.model.as_deref().unwrap_or("<default>"),
        stream = req.stream,
        messages = req.messages.len(),
        "chat completion request"
    );

    if req.stream {
        match state.proxy.handle_chat_stream(req).await {
            Ok(frames) => sse_response(frames),
            Err(rejection) => rejection_response(rejection),
        }
    } else {
        outcome_response(state.proxy.handle_chat(req).await)
    }
}

async fn handle_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let req: CanonicalCompletionRequest = match parse_body(&state, &body, started) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    tracing::info!(
        model = req.model.as_deref().unwrap_or("<default>"),
        stream = req.stream,
        prompt_chars = req.prompt.chars().count(),
        "text completion request"
    );

    if req.stream {
        match state.proxy.handle_completion_stream(req).await {
            Ok(frames) => sse_response(frames),
            Err(rejection) => rejection_response(rejection),
        }
    } else {
        outcome_response(state.proxy.handle_completion(req).await)
    }
}

fn parse_body<T: DeserializeOwned>(
    state: &AppState,
    body: &[u8],
    started: Instant,
) -> std::result::Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "failed to parse request body");
        let err = BrokerError::validation(format!("Invalid request body: {e}"));
        let proxy_name = state.proxy.snapshot().load().settings.name.clone();
        let envelope = ErrorEnvelope::new(&err, &proxy_name, started);
        (StatusCode::BAD_REQUEST, Json(envelope)).into_response()
    })
}

fn outcome_response(outcome: ProxyOutcome) -> Response {
    match outcome {
        ProxyOutcome::Completed(resp) => Json(resp).into_response(),
        ProxyOutcome::Failed(rejection) => rejection_response(rejection),
    }
}

fn rejection_response(rejection: Rejection) -> Response {
    let status = StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(rejection.envelope)).into_response()
}

/// One `data:` event per chunk, `[DONE]` at the end, or a single error envelope.
fn sse_response(frames: FrameStream) -> Response {
    let events = frames.map(|frame| match frame {
        ProxyFrame::Chunk(chunk) => Event::default().json_data(chunk),
        ProxyFrame::Error(envelope) => Event::default().json_data(envelope),
        ProxyFrame::Done => Ok(Event::default().data("[DONE]")),
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let name = state.proxy.snapshot().load().settings.name.clone();
    Json(json!({
        "name": name,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "chat": "/v1/chat/completions",
            "completions": "/v1/completions",
            "models": "/v1/models",
            "health": "/health",
        },
    }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.proxy.available_models().len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn handle_model_aliases(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "models": state.proxy.available_models() }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .proxy
        .describe_models()
        .into_iter()
        .map(|info| {
            json!({
                "id": info.alias,
                "object": "model",
                "owned_by": info.provider,
                "model_name": info.model_name,
                "api_key_masked": info.api_key_masked,
            })
        })
        .collect();

    Json(json!({ "data": models, "object": "list" }))
}
