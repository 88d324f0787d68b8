//! Google cloudcode internal generateContent adapters (Gemini-CLI and
//! Antigravity). Both speak the same wrapped protocol: the standard Gemini
//! request nested under `request` with a `project` field, responses nested
//! under `response`.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_pool::adapter::{Adapter, StreamReceiver};
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_protocol::gemini::{CountTokensResponse, GenerateContentResponse};
use llmux_protocol::sse::SseDecoder;
use llmux_transform::gemini::{GeminiStreamCollector, request_from_canonical, response_to_canonical};
use llmux_transform::{CanonicalRequest, CanonicalResponse, StreamEvent};

use crate::counting;
use crate::http::{self, HttpCtx};

const CLOUDCODE_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const GEMINI_CLI_UA: &str = "GeminiCLI/0.9.4 (linux; x64)";
const ANTIGRAVITY_UA: &str = "Antigravity/1.4 (linux; x64)";

const MODELS: [&str; 4] = [
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
];

pub struct GoogleInternalAdapter {
    ctx: HttpCtx,
    provider_type: ProviderType,
    base_url: String,
    user_agent: &'static str,
}

impl GoogleInternalAdapter {
    pub fn gemini_cli(ctx: HttpCtx) -> Self {
        Self {
            ctx,
            provider_type: ProviderType::GeminiCliOauth,
            base_url: CLOUDCODE_BASE.to_string(),
            user_agent: GEMINI_CLI_UA,
        }
    }

    pub fn antigravity(ctx: HttpCtx) -> Self {
        Self {
            ctx,
            provider_type: ProviderType::GeminiAntigravity,
            base_url: CLOUDCODE_BASE.to_string(),
            user_agent: ANTIGRAVITY_UA,
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }

    fn headers(&self, record: &ProviderRecord) -> ProviderResult<Vec<(String, String)>> {
        let access_token = record
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ProviderError::CredentialMissing(format!(
                    "provider {} has no access token",
                    record.uuid
                ))
            })?;
        Ok(vec![
            ("authorization".into(), format!("Bearer {access_token}")),
            ("content-type".into(), "application/json".into()),
            ("user-agent".into(), self.user_agent.to_string()),
        ])
    }

    fn wrapped_body(&self, record: &ProviderRecord, model: &str, req: &CanonicalRequest) -> JsonValue {
        let request = request_from_canonical(req);
        json!({
            "model": model,
            "project": record.project_id.clone().unwrap_or_default(),
            "request": request,
        })
    }
}

fn unwrap_response(bytes: &[u8]) -> ProviderResult<GenerateContentResponse> {
    let value: JsonValue = serde_json::from_slice(bytes)
        .map_err(|err| ProviderError::Protocol(format!("cloudcode response: {err}")))?;
    let inner = value.get("response").cloned().unwrap_or(value);
    serde_json::from_value(inner)
        .map_err(|err| ProviderError::Protocol(format!("cloudcode response shape: {err}")))
}

#[async_trait]
impl Adapter for GoogleInternalAdapter {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn default_health_model(&self) -> &'static str {
        "gemini-2.0-flash-lite"
    }

    async fn initialize(&self, record: &ProviderRecord) -> ProviderResult<()> {
        if record.has_usable_credential() {
            Ok(())
        } else {
            Err(ProviderError::CredentialMissing(format!(
                "provider {} has no usable Google credential",
                record.uuid
            )))
        }
    }

    async fn generate(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<CanonicalResponse> {
        let url = format!("{}:generateContent", self.base_url);
        let bytes = http::post_json(
            &self.ctx,
            &url,
            &self.headers(record)?,
            &self.wrapped_body(record, model, req),
        )
        .await?;
        Ok(response_to_canonical(model, unwrap_response(&bytes)?))
    }

    async fn stream(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<StreamReceiver> {
        let url = format!("{}:streamGenerateContent?alt=sse", self.base_url);
        let mut byte_rx = http::post_stream(
            &self.ctx,
            &url,
            &self.headers(record)?,
            &self.wrapped_body(record, model, req),
        )
        .await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(32);
        tokio::spawn(async move {
            let mut sse = SseDecoder::new();
            let mut collector = GeminiStreamCollector::new();
            while let Some(chunk) = byte_rx.recv().await {
                for frame in sse.feed_bytes(&chunk) {
                    let Ok(value) = serde_json::from_str::<JsonValue>(&frame.data) else {
                        continue;
                    };
                    let inner = value.get("response").cloned().unwrap_or(value);
                    let Ok(parsed) = serde_json::from_value::<GenerateContentResponse>(inner)
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
            for frame in sse.finish() {
                if let Ok(value) = serde_json::from_str::<JsonValue>(&frame.data) {
                    let inner = value.get("response").cloned().unwrap_or(value);
                    if let Ok(parsed) = serde_json::from_value::<GenerateContentResponse>(inner) {
                        for event in collector.collect(parsed) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
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

    async fn count_tokens(&self, record: &ProviderRecord, req: &CanonicalRequest) -> u32 {
        // Prefer the provider's count endpoint; fall back to local.
        let url = format!("{}:countTokens", self.base_url);
        let body = json!({
            "request": request_from_canonical(req),
            "project": record.project_id.clone().unwrap_or_default(),
        });
        if let Ok(headers) = self.headers(record)
            && let Ok(bytes) = http::post_json(&self.ctx, &url, &headers, &body).await
            && let Ok(parsed) = serde_json::from_slice::<CountTokensResponse>(&bytes)
        {
            return parsed.total_tokens;
        }
        counting::count_request_tokens(req)
    }

    async fn list_models(&self, _record: &ProviderRecord) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }
}
