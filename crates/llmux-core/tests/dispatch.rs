use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmux_common::error::GatewayError;
use llmux_core::config::GatewayConfig;
use llmux_core::dispatch::Engine;
use llmux_pool::events::EventHub;
use llmux_pool::pool::PoolManager;
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_pool::refresh::{RefreshEndpoints, TokenRefresher};
use llmux_transform::{CanonicalRequest, ContentPart, Message, StreamEvent};
use llmux_upstream::kiro::KiroAdapter;
use llmux_upstream::{AdapterRegistry, HttpCtx, WreqRefreshHttp};

fn fresh_expiry() -> String {
    llmux_common::timefmt::format_rfc3339(
        llmux_common::timefmt::now_utc() + time::Duration::hours(2),
    )
}

fn oauth_record(provider_type: ProviderType, uuid: &str, base_url: &str) -> ProviderRecord {
    let mut record = ProviderRecord::new(provider_type);
    record.uuid = uuid.to_string();
    record.access_token = Some("tok-initial".to_string());
    record.refresh_token = Some("rt".to_string());
    record.expires_at = Some(fresh_expiry());
    record.base_url = Some(base_url.to_string());
    record
}

async fn engine_with(
    config: GatewayConfig,
    records: Vec<ProviderRecord>,
    endpoints: RefreshEndpoints,
    registry: Arc<AdapterRegistry>,
) -> (Arc<Engine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool_path = dir.path().join("provider_pools.json");
    let mut doc = serde_json::Map::new();
    for record in records {
        let key = record.provider_type.as_str().to_string();
        let entry = doc
            .entry(key)
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        entry
            .as_array_mut()
            .unwrap()
            .push(serde_json::to_value(&record).unwrap());
    }
    std::fs::write(
        &pool_path,
        serde_json::to_string_pretty(&serde_json::Value::Object(doc)).unwrap(),
    )
    .unwrap();

    let pool = Arc::new(
        PoolManager::load(&pool_path, EventHub::default(), config.max_error_count)
            .await
            .unwrap(),
    );
    let refresher = Arc::new(TokenRefresher::new(Arc::new(WreqRefreshHttp::new()), endpoints));
    let engine = Arc::new(Engine::new(config, pool, registry, refresher, None));
    (engine, dir)
}

fn user_request(model: &str, text: &str) -> CanonicalRequest {
    let mut req = CanonicalRequest::new(model);
    req.messages.push(Message::user(vec![ContentPart::text(text)]));
    req
}

fn chat_completion_body(model: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-up1",
        "object": "chat.completion",
        "created": 1,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10 }
    })
}

/// Kiro-style event-stream framing around a JSON payload record.
fn framed(payload: &str) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x42, 0x1b, b':', b'x'];
    bytes.extend_from_slice(payload.as_bytes());
    bytes.push(0xff);
    bytes
}

#[tokio::test]
async fn happy_path_openai_to_kiro() {
    let server = MockServer::start().await;
    let mut body = framed(r#"{"content":"Hello"}"#);
    body.extend(framed(r#"{"content":" there"}"#));
    body.extend(framed(r#"{"contextUsagePercentage":12.5}"#));
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = GatewayConfig::default();
    config.default_provider = ProviderType::ClaudeKiroOauth;
    let record = oauth_record(ProviderType::ClaudeKiroOauth, "kiro-1", &server.uri());

    let registry = Arc::new(AdapterRegistry::default());
    registry.register(
        ProviderType::ClaudeKiroOauth,
        "kiro-1",
        Arc::new(KiroAdapter::with_base_url(HttpCtx::default(), &server.uri())),
    );

    let (engine, _dir) = engine_with(
        config,
        vec![record],
        RefreshEndpoints::default(),
        registry,
    )
    .await;

    let resp = engine
        .generate(user_request("claude-opus-4-5", "hi"))
        .await
        .unwrap();
    assert_eq!(resp.content, vec![ContentPart::text("Hello there")]);
    assert_eq!(resp.usage.input_tokens, 25_000);
    assert!(resp.usage.output_tokens > 0);
}

#[tokio::test]
async fn reactive_refresh_on_403_then_success() {
    let server = MockServer::start().await;
    // First upstream call: 403.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    // Exactly one refresh exchange.
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_partial_json(serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": "rt",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-refreshed",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;
    // Retried call succeeds.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_completion_body("qwen3-coder-plus", "after refresh")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = GatewayConfig::default();
    config.default_provider = ProviderType::OpenAiQwenOauth;
    let record = oauth_record(ProviderType::OpenAiQwenOauth, "qwen-1", &server.uri());

    let mut endpoints = RefreshEndpoints::default();
    endpoints.qwen_token = format!("{}/oauth2/token", server.uri());

    let (engine, _dir) = engine_with(
        config,
        vec![record],
        endpoints,
        Arc::new(AdapterRegistry::default()),
    )
    .await;

    let resp = engine
        .generate(user_request("qwen3-coder-plus", "hi"))
        .await
        .unwrap();
    assert_eq!(resp.content, vec![ContentPart::text("after refresh")]);

    let updated = engine
        .pool()
        .get(ProviderType::OpenAiQwenOauth, "qwen-1")
        .await
        .unwrap();
    assert_eq!(updated.access_token.as_deref(), Some("tok-refreshed"));
}

#[tokio::test]
async fn fallback_to_next_provider_after_5xx_exhaustion() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    let mut config = GatewayConfig::default();
    config.default_provider = ProviderType::OpenAiQwenOauth;
    config.fallback_chain = vec![ProviderType::OpenAiIflow];
    config.request_max_retries = 1;
    config.request_base_delay = Duration::from_millis(5);
    config
        .model_fallback
        .insert("qwen3-coder-plus".to_string(), vec!["qwen3-coder".to_string()]);

    // Primary keeps failing: initial attempt + one retry.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&primary)
        .await;
    // Secondary serves the substituted model.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "qwen3-coder"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_completion_body("qwen3-coder", "served by fallback")),
        )
        .expect(1)
        .mount(&secondary)
        .await;

    let records = vec![
        oauth_record(ProviderType::OpenAiQwenOauth, "qwen-1", &primary.uri()),
        oauth_record(ProviderType::OpenAiIflow, "iflow-1", &secondary.uri()),
    ];
    let (engine, _dir) = engine_with(
        config,
        records,
        RefreshEndpoints::default(),
        Arc::new(AdapterRegistry::default()),
    )
    .await;

    let resp = engine
        .generate(user_request("qwen3-coder-plus", "hi"))
        .await
        .unwrap();
    assert_eq!(
        resp.content,
        vec![ContentPart::text("served by fallback")]
    );

    // The failing provider took exactly one unhealthy mark for the request.
    let primary_record = engine
        .pool()
        .get(ProviderType::OpenAiQwenOauth, "qwen-1")
        .await
        .unwrap();
    assert_eq!(primary_record.error_count, 1);
}

#[tokio::test]
async fn disabled_provider_is_never_selected() {
    let mut config = GatewayConfig::default();
    config.default_provider = ProviderType::OpenAiQwenOauth;
    let mut record = oauth_record(
        ProviderType::OpenAiQwenOauth,
        "qwen-1",
        "http://127.0.0.1:9",
    );
    record.is_disabled = true;

    let (engine, _dir) = engine_with(
        config,
        vec![record],
        RefreshEndpoints::default(),
        Arc::new(AdapterRegistry::default()),
    )
    .await;

    for _ in 0..5 {
        let err = engine
            .generate(user_request("qwen3-coder-plus", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoProviderAvailable { .. }));
    }
}

#[tokio::test]
async fn streaming_bracket_tool_call_is_extracted_and_stripped() {
    let server = MockServer::start().await;
    let mut body = framed(r#"{"content":"ok "}"#);
    body.extend(framed(
        r#"{"content":"[Called search with args: {\"q\":\"x\"}]"}"#,
    ));
    body.extend(framed(r#"{"content":" done"}"#));
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let mut config = GatewayConfig::default();
    config.default_provider = ProviderType::ClaudeKiroOauth;
    let record = oauth_record(ProviderType::ClaudeKiroOauth, "kiro-1", &server.uri());

    let registry = Arc::new(AdapterRegistry::default());
    registry.register(
        ProviderType::ClaudeKiroOauth,
        "kiro-1",
        Arc::new(KiroAdapter::with_base_url(HttpCtx::default(), &server.uri())),
    );
    let (engine, _dir) = engine_with(
        config,
        vec![record],
        RefreshEndpoints::default(),
        registry,
    )
    .await;

    let mut rx = engine
        .stream(user_request("claude-opus-4-5", "hi"))
        .await
        .unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let text: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::TextDelta { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "ok  done");

    let tool_start = events
        .iter()
        .find_map(|event| match event {
            StreamEvent::ToolUseStart { name, .. } => Some(name.clone()),
            _ => None,
        })
        .expect("tool use should be synthesized");
    assert_eq!(tool_start, "search");

    let tool_args: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::ToolUseDelta { partial_json, .. } => Some(partial_json.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&tool_args).unwrap(),
        serde_json::json!({"q": "x"})
    );

    match events.last() {
        Some(StreamEvent::Finish { usage, .. }) => assert!(usage.input_tokens > 0),
        other => panic!("stream must end with Finish, got {other:?}"),
    }
}

#[tokio::test]
async fn selection_spreads_across_healthy_providers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_completion_body("qwen3-coder-plus", "ok")),
        )
        .mount(&server)
        .await;

    let mut config = GatewayConfig::default();
    config.default_provider = ProviderType::OpenAiQwenOauth;
    let records = vec![
        oauth_record(ProviderType::OpenAiQwenOauth, "a", &server.uri()),
        oauth_record(ProviderType::OpenAiQwenOauth, "b", &server.uri()),
        oauth_record(ProviderType::OpenAiQwenOauth, "c", &server.uri()),
    ];
    let (engine, _dir) = engine_with(
        config,
        records,
        RefreshEndpoints::default(),
        Arc::new(AdapterRegistry::default()),
    )
    .await;

    for _ in 0..9 {
        engine
            .generate(user_request("qwen3-coder-plus", "hi"))
            .await
            .unwrap();
    }
    let mut counts = Vec::new();
    for uuid in ["a", "b", "c"] {
        let record = engine
            .pool()
            .get(ProviderType::OpenAiQwenOauth, uuid)
            .await
            .unwrap();
        counts.push(record.usage_count);
    }
    // ceil(9/3)+1 bound from the fairness property.
    assert!(counts.iter().all(|&c| c <= 4), "unfair: {counts:?}");
    assert_eq!(counts.iter().sum::<u64>(), 9);
}
