//! Adapter instance cache, keyed by `(providerType, uuid)`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use llmux_pool::adapter::Adapter;
use llmux_pool::record::{ProviderRecord, ProviderType};

use crate::claude_compat::ClaudeCompatAdapter;
use crate::geminicli::GoogleInternalAdapter;
use crate::http::HttpCtx;
use crate::kiro::KiroAdapter;
use crate::openai_like::OpenAiLikeAdapter;

/// Builds and caches adapters. Adapters are stateless apart from their
/// connection pool, so one instance per credential serves concurrent calls.
pub struct AdapterRegistry {
    cache: Mutex<HashMap<(ProviderType, String), Arc<dyn Adapter>>>,
    proxy_url: Option<String>,
    proxy_enabled: HashSet<ProviderType>,
}

impl AdapterRegistry {
    pub fn new(proxy_url: Option<String>, proxy_enabled: HashSet<ProviderType>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            proxy_url: proxy_url.filter(|p| !p.trim().is_empty()),
            proxy_enabled,
        }
    }

    fn http_ctx(&self, provider_type: ProviderType) -> HttpCtx {
        HttpCtx {
            proxy: self
                .proxy_url
                .clone()
                .filter(|_| self.proxy_enabled.contains(&provider_type)),
        }
    }

    pub fn adapter_for(&self, record: &ProviderRecord) -> Arc<dyn Adapter> {
        let key = (record.provider_type, record.uuid.clone());
        if let Ok(mut guard) = self.cache.lock() {
            if let Some(adapter) = guard.get(&key) {
                return adapter.clone();
            }
            let adapter = self.build(record.provider_type);
            guard.insert(key, adapter.clone());
            return adapter;
        }
        self.build(record.provider_type)
    }

    fn build(&self, provider_type: ProviderType) -> Arc<dyn Adapter> {
        let ctx = self.http_ctx(provider_type);
        match provider_type {
            ProviderType::ClaudeKiroOauth => Arc::new(KiroAdapter::new(ctx)),
            ProviderType::GeminiCliOauth => Arc::new(GoogleInternalAdapter::gemini_cli(ctx)),
            ProviderType::GeminiAntigravity => Arc::new(GoogleInternalAdapter::antigravity(ctx)),
            ProviderType::OpenAiQwenOauth => Arc::new(OpenAiLikeAdapter::qwen(ctx)),
            ProviderType::OpenAiIflow => Arc::new(OpenAiLikeAdapter::iflow(ctx)),
            ProviderType::OpenAiCustom => Arc::new(OpenAiLikeAdapter::custom(ctx)),
            ProviderType::ClaudeCustom => Arc::new(ClaudeCompatAdapter::new(ctx)),
        }
    }

    /// Register a prebuilt adapter (tests point fake endpoints here).
    pub fn register(&self, provider_type: ProviderType, uuid: &str, adapter: Arc<dyn Adapter>) {
        if let Ok(mut guard) = self.cache.lock() {
            guard.insert((provider_type, uuid.to_string()), adapter);
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new(None, HashSet::new())
    }
}
