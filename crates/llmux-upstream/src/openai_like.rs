//! OpenAI-shaped adapters: Qwen and iFlow portals (OAuth bearer) and the
//! generic key-based OpenAI-compatible endpoint.

use async_trait::async_trait;

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_pool::adapter::{Adapter, StreamReceiver};
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_protocol::openai::{ChatCompletionChunk, ChatCompletionResponse, ModelList};
use llmux_protocol::sse::SseDecoder;
use llmux_transform::openai::{
    OpenAiStreamCollector, request_from_canonical, response_to_canonical,
};
use llmux_transform::{CanonicalRequest, CanonicalResponse, StreamEvent};

use crate::counting;
use crate::http::{self, HttpCtx};

const QWEN_BASE: &str = "https://portal.qwen.ai/v1";
const IFLOW_BASE: &str = "https://apis.iflow.cn/v1";

pub struct OpenAiLikeAdapter {
    ctx: HttpCtx,
    provider_type: ProviderType,
    default_base: &'static str,
    health_model: &'static str,
    fallback_models: &'static [&'static str],
}

impl OpenAiLikeAdapter {
    pub fn qwen(ctx: HttpCtx) -> Self {
        Self {
            ctx,
            provider_type: ProviderType::OpenAiQwenOauth,
            default_base: QWEN_BASE,
            health_model: "qwen3-coder-flash",
            fallback_models: &["qwen3-coder-plus", "qwen3-coder-flash"],
        }
    }

    pub fn iflow(ctx: HttpCtx) -> Self {
        Self {
            ctx,
            provider_type: ProviderType::OpenAiIflow,
            default_base: IFLOW_BASE,
            health_model: "qwen3-coder",
            fallback_models: &["qwen3-coder", "kimi-k2", "glm-4.6"],
        }
    }

    pub fn custom(ctx: HttpCtx) -> Self {
        Self {
            ctx,
            provider_type: ProviderType::OpenAiCustom,
            default_base: "https://api.openai.com/v1",
            health_model: "gpt-4o-mini",
            fallback_models: &["gpt-4o-mini"],
        }
    }

    fn base_url<'a>(&'a self, record: &'a ProviderRecord) -> &'a str {
        record
            .base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/'))
            .unwrap_or(self.default_base)
    }

    fn bearer_token<'a>(&self, record: &'a ProviderRecord) -> ProviderResult<&'a str> {
        let token = if self.provider_type.uses_oauth() {
            record.access_token.as_deref()
        } else {
            record.api_key.as_deref()
        };
        token.filter(|t| !t.is_empty()).ok_or_else(|| {
            ProviderError::CredentialMissing(format!(
                "provider {} has no bearer credential",
                record.uuid
            ))
        })
    }

    fn headers(&self, record: &ProviderRecord) -> ProviderResult<Vec<(String, String)>> {
        Ok(vec![
            (
                "authorization".to_string(),
                format!("Bearer {}", self.bearer_token(record)?),
            ),
            ("content-type".to_string(), "application/json".to_string()),
        ])
    }
}

#[async_trait]
impl Adapter for OpenAiLikeAdapter {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn default_health_model(&self) -> &'static str {
        self.health_model
    }

    async fn initialize(&self, record: &ProviderRecord) -> ProviderResult<()> {
        self.bearer_token(record).map(|_| ())
    }

    async fn generate(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<CanonicalResponse> {
        let url = format!("{}/chat/completions", self.base_url(record));
        let mut wire = request_from_canonical(req);
        wire.model = model.to_string();
        wire.stream = None;
        let body = serde_json::to_value(&wire)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let bytes = http::post_json(&self.ctx, &url, &self.headers(record)?, &body).await?;
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::Protocol(format!("chat completion: {err}")))?;
        Ok(response_to_canonical(parsed))
    }

    async fn stream(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<StreamReceiver> {
        let url = format!("{}/chat/completions", self.base_url(record));
        let mut wire = request_from_canonical(req);
        wire.model = model.to_string();
        wire.stream = Some(true);
        let body = serde_json::to_value(&wire)
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let mut byte_rx =
            http::post_stream(&self.ctx, &url, &self.headers(record)?, &body).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(32);
        tokio::spawn(async move {
            let mut sse = SseDecoder::new();
            let mut collector = OpenAiStreamCollector::new();
            while let Some(chunk) = byte_rx.recv().await {
                for frame in sse.feed_bytes(&chunk) {
                    if frame.data.trim() == "[DONE]" {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<ChatCompletionChunk>(&frame.data)
                    else {
                        continue;
                    };
                    for event in collector.collect(parsed) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
            for event in collector.finish() {
                let _ = tx.send(event).await;
            }
        });
        Ok(rx)
    }

    async fn count_tokens(&self, _record: &ProviderRecord, req: &CanonicalRequest) -> u32 {
        counting::count_request_tokens(req)
    }

    async fn list_models(&self, record: &ProviderRecord) -> Vec<String> {
        let url = format!("{}/models", self.base_url(record));
        if let Ok(headers) = self.headers(record)
            && let Ok(bytes) = http::get_json(&self.ctx, &url, &headers).await
            && let Ok(parsed) = serde_json::from_slice::<ModelList>(&bytes)
        {
            return parsed.data.into_iter().map(|m| m.id).collect();
        }
        self.fallback_models.iter().map(|m| m.to_string()).collect()
    }
}
