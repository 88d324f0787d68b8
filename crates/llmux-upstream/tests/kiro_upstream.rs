use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmux_pool::adapter::Adapter;
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_transform::{CanonicalRequest, ContentPart, Message, StreamEvent};
use llmux_upstream::HttpCtx;
use llmux_upstream::kiro::KiroAdapter;

fn kiro_record() -> ProviderRecord {
    let mut record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
    record.uuid = "kiro-test".to_string();
    record.access_token = Some("tok".to_string());
    record.refresh_token = Some("rt".to_string());
    record.profile_arn = Some("arn:aws:codewhisperer:profile/x".to_string());
    record
}

fn request() -> CanonicalRequest {
    let mut req = CanonicalRequest::new("claude-opus-4-5");
    req.messages
        .push(Message::user(vec![ContentPart::text("do the thing")]));
    req
}

fn framed(payload: &str) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x10, 0x07, b':'];
    bytes.extend_from_slice(payload.as_bytes());
    bytes.extend_from_slice(&[0x00, 0xc0]);
    bytes
}

#[tokio::test]
async fn stream_reconstructs_structured_tool_use_across_frames() {
    let server = MockServer::start().await;
    let mut body = framed(r#"{"content":"let me check"}"#);
    body.extend(framed(
        r#"{"name":"search","toolUseId":"tu-1","input":"{\"q\":"}"#,
    ));
    body.extend(framed(r#"{"input":"\"rust\"}"}"#));
    body.extend(framed(r#"{"stop":true}"#));
    body.extend(framed(r#"{"contextUsagePercentage":50}"#));
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = KiroAdapter::with_base_url(HttpCtx::default(), &server.uri());
    let mut rx = adapter
        .stream(&kiro_record(), "claude-opus-4-5", &request())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(StreamEvent::Start { .. })));
    let args: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::ToolUseDelta { id, partial_json } if id == "tu-1" => {
                Some(partial_json.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(args, "{\"q\":\"rust\"}");
    assert!(
        events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolUseStop { id } if id == "tu-1"))
    );
    match events.last() {
        Some(StreamEvent::Finish { usage, .. }) => {
            // 50% of the 200k window.
            assert_eq!(usage.input_tokens, 100_000);
        }
        other => panic!("expected Finish, got {other:?}"),
    }
}

#[tokio::test]
async fn generate_decodes_buffered_event_stream() {
    let server = MockServer::start().await;
    let mut body = framed(r#"{"content":"part one"}"#);
    body.extend(framed(r#"{"content":", part two"}"#));
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let adapter = KiroAdapter::with_base_url(HttpCtx::default(), &server.uri());
    let resp = adapter
        .generate(&kiro_record(), "claude-opus-4-5", &request())
        .await
        .unwrap();
    assert_eq!(resp.content, vec![ContentPart::text("part one, part two")]);
}

#[tokio::test]
async fn usage_limits_scrapes_agentic_resource() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/getUsageLimits"))
        .and(query_param("resourceType", "AGENTIC_REQUEST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "limits": [{ "resourceType": "AGENTIC_REQUEST", "used": 3, "total": 500 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = KiroAdapter::with_base_url(HttpCtx::default(), &server.uri());
    let usage = adapter.usage_limits(&kiro_record()).await.unwrap();
    assert_eq!(usage["limits"][0]["used"], 3);
}

#[tokio::test]
async fn upstream_error_status_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let adapter = KiroAdapter::with_base_url(HttpCtx::default(), &server.uri());
    let err = adapter
        .generate(&kiro_record(), "claude-opus-4-5", &request())
        .await
        .unwrap_err();
    assert!(err.is_retriable());
}
