//! Generic key-based Anthropic-compatible adapter.

use async_trait::async_trait;

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_pool::adapter::{Adapter, StreamReceiver};
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_protocol::claude::{
    CountTokensResponse, MessagesResponse, StreamEvent as ClaudeWireEvent,
};
use llmux_protocol::sse::SseDecoder;
use llmux_transform::claude::{
    ClaudeStreamCollector, request_from_canonical, response_to_canonical,
};
use llmux_transform::{CanonicalRequest, CanonicalResponse, StreamEvent};

use crate::counting;
use crate::http::{self, HttpCtx};

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const MODELS: [&str; 3] = ["claude-opus-4-5", "claude-sonnet-4-5", "claude-haiku-4-5"];

pub struct ClaudeCompatAdapter {
    ctx: HttpCtx,
}

impl ClaudeCompatAdapter {
    pub fn new(ctx: HttpCtx) -> Self {
        Self { ctx }
    }

    fn base_url<'a>(&self, record: &'a ProviderRecord) -> &'a str {
        record
            .base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/'))
            .unwrap_or(DEFAULT_BASE)
    }

    fn headers(&self, record: &ProviderRecord) -> ProviderResult<Vec<(String, String)>> {
        let api_key = record
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProviderError::CredentialMissing(format!(
                    "provider {} has no api key",
                    record.uuid
                ))
            })?;
        Ok(vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ])
    }

    fn wire_body(
        &self,
        model: &str,
        req: &CanonicalRequest,
        stream: bool,
    ) -> ProviderResult<serde_json::Value> {
        let mut wire = request_from_canonical(req);
        wire.model = model.to_string();
        wire.stream = stream.then_some(true);
        serde_json::to_value(&wire).map_err(|err| ProviderError::Other(err.to_string()))
    }
}

#[async_trait]
impl Adapter for ClaudeCompatAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::ClaudeCustom
    }

    fn default_health_model(&self) -> &'static str {
        "claude-haiku-4-5"
    }

    async fn initialize(&self, record: &ProviderRecord) -> ProviderResult<()> {
        self.headers(record).map(|_| ())
    }

    async fn generate(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<CanonicalResponse> {
        let url = format!("{}/v1/messages", self.base_url(record));
        let body = self.wire_body(model, req, false)?;
        let bytes = http::post_json(&self.ctx, &url, &self.headers(record)?, &body).await?;
        let parsed: MessagesResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::Protocol(format!("messages response: {err}")))?;
        Ok(response_to_canonical(parsed))
    }

    async fn stream(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<StreamReceiver> {
        let url = format!("{}/v1/messages", self.base_url(record));
        let body = self.wire_body(model, req, true)?;
        let mut byte_rx =
            http::post_stream(&self.ctx, &url, &self.headers(record)?, &body).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(32);
        tokio::spawn(async move {
            let mut sse = SseDecoder::new();
            let mut collector = ClaudeStreamCollector::new();
            while let Some(chunk) = byte_rx.recv().await {
                for frame in sse.feed_bytes(&chunk) {
                    let Ok(parsed) = serde_json::from_str::<ClaudeWireEvent>(&frame.data) else {
                        continue;
                    };
                    for event in collector.collect(parsed) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn count_tokens(&self, record: &ProviderRecord, req: &CanonicalRequest) -> u32 {
        let url = format!("{}/v1/messages/count_tokens", self.base_url(record));
        if let Ok(body) = self.wire_body(&req.model, req, false)
            && let Ok(headers) = self.headers(record)
            && let Ok(bytes) = http::post_json(&self.ctx, &url, &headers, &body).await
            && let Ok(parsed) = serde_json::from_slice::<CountTokensResponse>(&bytes)
        {
            return parsed.input_tokens;
        }
        counting::count_request_tokens(req)
    }

    async fn list_models(&self, _record: &ProviderRecord) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }
}
