use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use llmux_common::error::ProviderResult;
use llmux_transform::{CanonicalRequest, CanonicalResponse, StreamEvent};

use crate::record::{ProviderRecord, ProviderType};

/// Lazy finite event sequence; the sender side stops at `Finish` (or when
/// the receiver is dropped, which cancels the upstream body).
pub type StreamReceiver = tokio::sync::mpsc::Receiver<StreamEvent>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub uuid: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The uniform capability surface every concrete provider implements.
///
/// Adapters hold no per-request state beyond their connection pool, so one
/// instance per `(providerType, uuid)` serves concurrent calls. Credentials
/// arrive with each call via the live [`ProviderRecord`].
#[async_trait]
pub trait Adapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Cheapest model for health probes.
    fn default_health_model(&self) -> &'static str;

    /// Idempotent setup (credential presence checks and the like).
    async fn initialize(&self, _record: &ProviderRecord) -> ProviderResult<()> {
        Ok(())
    }

    async fn generate(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<CanonicalResponse>;

    async fn stream(
        &self,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<StreamReceiver>;

    /// Best-effort; never fails.
    async fn count_tokens(&self, record: &ProviderRecord, req: &CanonicalRequest) -> u32;

    async fn list_models(&self, record: &ProviderRecord) -> Vec<String>;

    /// Provider-specific quota/usage scrape. Most providers do not support
    /// this; the admin surface renders the `NotSupported` case structurally.
    async fn usage_limits(&self, _record: &ProviderRecord) -> ProviderResult<JsonValue> {
        Err(llmux_common::error::ProviderError::NotSupported(
            "usage limits",
        ))
    }
}
