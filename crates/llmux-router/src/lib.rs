//! Inbound HTTP surface: the three dialect route families plus liveness.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value as JsonValue, json};
use tokio_stream::wrappers::ReceiverStream;

use llmux_common::error::GatewayError;
use llmux_core::auth::{authorize, extract_api_key};
use llmux_core::dispatch::Engine;
use llmux_core::error::render_error;
use llmux_pool::adapter::StreamReceiver;
use llmux_pool::record::WireDialect;
use llmux_protocol::claude as claude_wire;
use llmux_protocol::gemini as gemini_wire;
use llmux_protocol::openai as openai_wire;
use llmux_transform::{claude, gemini, openai};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn gateway_router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/messages/count_tokens", post(claude_count_tokens))
        .route("/v1/models", get(models_list_v1))
        .route("/v1beta/models", get(models_list_v1beta))
        .route("/v1beta/models/{*action}", post(gemini_post))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

fn check_auth(
    state: &AppState,
    dialect: WireDialect,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<(), Response> {
    let key = extract_api_key(headers, query);
    authorize(state.engine.config(), key.as_deref())
        .map_err(|err| error_response(dialect, &err))
}

fn error_response(dialect: WireDialect, err: &GatewayError) -> Response {
    let (status, body) = render_error(dialect, err);
    json_response(status, &body)
}

fn json_response(status: u16, body: &JsonValue) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(body.clone())).into_response()
}

fn bad_request(dialect: WireDialect, message: impl Into<String>) -> Response {
    error_response(dialect, &GatewayError::BadRequest(message.into()))
}

fn sse_response(body_rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(body_rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ---- OpenAI dialect ----

async fn openai_chat(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = WireDialect::OpenAi;
    if let Err(resp) = check_auth(&state, dialect, &headers, query.as_deref()) {
        return resp;
    }
    let wire: openai_wire::ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(wire) => wire,
        Err(err) => return bad_request(dialect, err.to_string()),
    };
    let req = openai::request_to_canonical(wire);
    let created = time::OffsetDateTime::now_utc().unix_timestamp();

    if req.stream {
        match state.engine.stream(req).await {
            Ok(events) => {
                let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
                tokio::spawn(pump_openai_stream(events, created, tx));
                sse_response(rx)
            }
            Err(err) => error_response(dialect, &err),
        }
    } else {
        match state.engine.generate(req).await {
            Ok(resp) => {
                let wire = openai::response_from_canonical(&resp, created);
                json_response(200, &serde_json::to_value(wire).unwrap_or_default())
            }
            Err(err) => error_response(dialect, &err),
        }
    }
}

async fn pump_openai_stream(
    mut events: StreamReceiver,
    created: i64,
    tx: tokio::sync::mpsc::Sender<Bytes>,
) {
    let mut emitter = openai::OpenAiStreamEmitter::new(created);
    while let Some(event) = events.recv().await {
        for chunk in emitter.emit(event) {
            let Ok(json) = serde_json::to_string(&chunk) else {
                continue;
            };
            if tx.send(Bytes::from(format!("data: {json}\n\n"))).await.is_err() {
                return;
            }
        }
    }
    let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
}

// ---- Claude dialect ----

async fn claude_messages(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = WireDialect::Claude;
    if let Err(resp) = check_auth(&state, dialect, &headers, query.as_deref()) {
        return resp;
    }
    let wire: claude_wire::MessagesRequest = match serde_json::from_slice(&body) {
        Ok(wire) => wire,
        Err(err) => return bad_request(dialect, err.to_string()),
    };
    let req = claude::request_to_canonical(wire);

    if req.stream {
        match state.engine.stream(req).await {
            Ok(events) => {
                let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
                tokio::spawn(pump_claude_stream(events, tx));
                sse_response(rx)
            }
            Err(err) => error_response(dialect, &err),
        }
    } else {
        match state.engine.generate(req).await {
            Ok(resp) => {
                let wire = claude::response_from_canonical(&resp);
                json_response(200, &serde_json::to_value(wire).unwrap_or_default())
            }
            Err(err) => error_response(dialect, &err),
        }
    }
}

async fn pump_claude_stream(mut events: StreamReceiver, tx: tokio::sync::mpsc::Sender<Bytes>) {
    let mut emitter = claude::ClaudeStreamEmitter::new();
    while let Some(event) = events.recv().await {
        for wire in emitter.emit(event) {
            let Ok(json) = serde_json::to_string(&wire) else {
                continue;
            };
            let frame = format!("event: {}\ndata: {json}\n\n", wire.event_name());
            if tx.send(Bytes::from(frame)).await.is_err() {
                return;
            }
        }
    }
}

async fn claude_count_tokens(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = WireDialect::Claude;
    if let Err(resp) = check_auth(&state, dialect, &headers, query.as_deref()) {
        return resp;
    }
    let wire: claude_wire::MessagesRequest = match serde_json::from_slice(&body) {
        Ok(wire) => wire,
        Err(err) => return bad_request(dialect, err.to_string()),
    };
    let req = claude::request_to_canonical(wire);
    let input_tokens = state.engine.count_tokens(&req).await;
    json_response(
        200,
        &serde_json::to_value(claude_wire::CountTokensResponse { input_tokens })
            .unwrap_or_default(),
    )
}

// ---- Gemini dialect ----

async fn gemini_post(
    State(state): State<AppState>,
    Path(action): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = WireDialect::Gemini;
    if let Err(resp) = check_auth(&state, dialect, &headers, query.as_deref()) {
        return resp;
    }
    let Some((model, verb)) = action.rsplit_once(':') else {
        return bad_request(dialect, "expected {model}:{operation}");
    };
    let wire: gemini_wire::GenerateContentRequest = match serde_json::from_slice(&body) {
        Ok(wire) => wire,
        Err(err) => return bad_request(dialect, err.to_string()),
    };

    match verb {
        "generateContent" => {
            let req = gemini::request_to_canonical(model, false, wire);
            match state.engine.generate(req).await {
                Ok(resp) => {
                    let wire = gemini::response_from_canonical(&resp);
                    json_response(200, &serde_json::to_value(wire).unwrap_or_default())
                }
                Err(err) => error_response(dialect, &err),
            }
        }
        "streamGenerateContent" => {
            let req = gemini::request_to_canonical(model, true, wire);
            match state.engine.stream(req).await {
                Ok(events) => {
                    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
                    tokio::spawn(pump_gemini_stream(events, tx));
                    sse_response(rx)
                }
                Err(err) => error_response(dialect, &err),
            }
        }
        "countTokens" => {
            let req = gemini::request_to_canonical(model, false, wire);
            let total_tokens = state.engine.count_tokens(&req).await;
            json_response(
                200,
                &serde_json::to_value(gemini_wire::CountTokensResponse { total_tokens })
                    .unwrap_or_default(),
            )
        }
        other => bad_request(dialect, format!("unknown operation {other:?}")),
    }
}

async fn pump_gemini_stream(mut events: StreamReceiver, tx: tokio::sync::mpsc::Sender<Bytes>) {
    let mut emitter = gemini::GeminiStreamEmitter::new();
    while let Some(event) = events.recv().await {
        for chunk in emitter.emit(event) {
            let Ok(json) = serde_json::to_string(&chunk) else {
                continue;
            };
            if tx.send(Bytes::from(format!("data: {json}\n\n"))).await.is_err() {
                return;
            }
        }
    }
}

// ---- model listings ----

async fn models_list_v1(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let dialect = WireDialect::OpenAi;
    if let Err(resp) = check_auth(&state, dialect, &headers, query.as_deref()) {
        return resp;
    }
    let created = time::OffsetDateTime::now_utc().unix_timestamp();
    let data: Vec<openai_wire::ModelEntry> = state
        .engine
        .list_models()
        .await
        .into_iter()
        .map(|id| openai_wire::ModelEntry {
            id,
            object: "model".to_string(),
            created,
            owned_by: "llmux".to_string(),
        })
        .collect();
    let list = openai_wire::ModelList {
        object: "list".to_string(),
        data,
    };
    json_response(200, &serde_json::to_value(list).unwrap_or_default())
}

async fn models_list_v1beta(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let dialect = WireDialect::Gemini;
    if let Err(resp) = check_auth(&state, dialect, &headers, query.as_deref()) {
        return resp;
    }
    let models: Vec<gemini_wire::ModelEntry> = state
        .engine
        .list_models()
        .await
        .into_iter()
        .map(|id| gemini_wire::ModelEntry {
            name: format!("models/{id}"),
            display_name: None,
            supported_generation_methods: Some(vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
            ]),
        })
        .collect();
    let list = gemini_wire::ModelList { models };
    json_response(200, &serde_json::to_value(list).unwrap_or_default())
}
