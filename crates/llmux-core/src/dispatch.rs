//! The request pipeline: select a provider, guard token expiry, call the
//! adapter, retry with backoff inside the provider, fall back across the
//! provider chain, and normalize usage on the way out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use llmux_common::error::{GatewayError, ProviderError, ProviderResult};
use llmux_pool::adapter::{Adapter, StreamReceiver};
use llmux_pool::pool::PoolManager;
use llmux_pool::record::{ProviderRecord, ProviderType};
use llmux_pool::refresh::TokenRefresher;
use llmux_transform::{CanonicalRequest, CanonicalResponse, StreamEvent, TokenUsage};
use llmux_upstream::AdapterRegistry;
use llmux_upstream::counting;

use crate::config::GatewayConfig;
use crate::system_prompt::apply_system_prompt;

pub struct Engine {
    config: GatewayConfig,
    pool: Arc<PoolManager>,
    registry: Arc<AdapterRegistry>,
    refresher: Arc<TokenRefresher>,
    system_prompt: Option<String>,
}

enum CallOutcome {
    Response(Box<CanonicalResponse>),
    Stream(StreamReceiver),
}

impl Engine {
    pub fn new(
        config: GatewayConfig,
        pool: Arc<PoolManager>,
        registry: Arc<AdapterRegistry>,
        refresher: Arc<TokenRefresher>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            config,
            pool,
            registry,
            refresher,
            system_prompt,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub async fn generate(
        &self,
        mut req: CanonicalRequest,
    ) -> Result<CanonicalResponse, GatewayError> {
        req.stream = false;
        self.prepare(&mut req);
        match self.dispatch(&req).await? {
            CallOutcome::Response(resp) => Ok(*resp),
            CallOutcome::Stream(_) => unreachable!("non-stream dispatch returned a stream"),
        }
    }

    pub async fn stream(
        &self,
        mut req: CanonicalRequest,
    ) -> Result<StreamReceiver, GatewayError> {
        req.stream = true;
        self.prepare(&mut req);
        let local_input = counting::count_request_tokens(&req);
        match self.dispatch(&req).await? {
            CallOutcome::Stream(rx) => Ok(normalize_stream_usage(rx, local_input)),
            CallOutcome::Response(_) => unreachable!("stream dispatch returned a response"),
        }
    }

    pub async fn count_tokens(&self, req: &CanonicalRequest) -> u32 {
        // Counting stays local to keep it a pure function of the request.
        counting::count_request_tokens(req)
    }

    /// Models visible across every active provider type.
    pub async fn list_models(&self) -> Vec<String> {
        let mut models = Vec::new();
        for provider_type in self.pool.active_types().await {
            let Some(record) = self.pool.records_of(provider_type).await.into_iter().next()
            else {
                continue;
            };
            let adapter = self.registry.adapter_for(&record);
            for model in adapter.list_models(&record).await {
                if !models.contains(&model) {
                    models.push(model);
                }
            }
        }
        models
    }

    /// Probe one provider type's records with a minimal generate call.
    pub async fn check_health(
        &self,
        provider_type: ProviderType,
        force: bool,
    ) -> Vec<llmux_pool::adapter::HealthReport> {
        let registry = self.registry.clone();
        let refresher = self.refresher.clone();
        let pool = self.pool.clone();
        let window = self.config.cron_near_window;
        self.pool
            .check_health(provider_type, force, move |record| {
                let registry = registry.clone();
                let refresher = refresher.clone();
                let pool = pool.clone();
                async move {
                    let adapter = registry.adapter_for(&record);
                    let record = refresher.ensure_fresh(&pool, &record, window).await?;
                    let model = adapter.default_health_model().to_string();
                    let mut probe = CanonicalRequest::new(model.clone());
                    probe.max_tokens = Some(1);
                    probe
                        .messages
                        .push(llmux_transform::Message::user(vec![
                            llmux_transform::ContentPart::text("ping"),
                        ]));
                    adapter.generate(&record, &model, &probe).await?;
                    Ok(model)
                }
            })
            .await
    }

    pub async fn usage_limits(
        &self,
        provider_type: ProviderType,
        uuid: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        let record = self
            .pool
            .get(provider_type, uuid)
            .await
            .ok_or(GatewayError::NoProviderAvailable {
                provider_type: provider_type.as_str().to_string(),
            })?;
        let adapter = self.registry.adapter_for(&record);
        match adapter.usage_limits(&record).await {
            Ok(value) => Ok(value),
            // One-shot refresh-and-retry on an auth rejection.
            Err(err) if err.is_auth_rejection() => {
                let record = self
                    .refresher
                    .refresh_now(&self.pool, &record)
                    .await
                    .map_err(GatewayError::Provider)?;
                adapter
                    .usage_limits(&record)
                    .await
                    .map_err(GatewayError::Provider)
            }
            Err(err) => Err(GatewayError::Provider(err)),
        }
    }

    fn prepare(&self, req: &mut CanonicalRequest) {
        apply_system_prompt(
            req,
            self.system_prompt.as_deref(),
            self.config.system_prompt_mode,
        );
    }

    /// Walk the provider chain; inside each provider run the retry policy.
    async fn dispatch(&self, req: &CanonicalRequest) -> Result<CallOutcome, GatewayError> {
        let chain = self.config.provider_chain();
        let mut last_error: Option<ProviderError> = None;

        for (chain_index, provider_type) in chain.iter().copied().enumerate() {
            let Some(record) = self.pool.select(provider_type).await else {
                debug!(provider = provider_type.as_str(), "no selectable provider");
                continue;
            };
            let adapter = self.registry.adapter_for(&record);
            if let Err(err) = adapter.initialize(&record).await {
                self.pool
                    .mark_unhealthy(provider_type, &record.uuid, &err.to_string())
                    .await;
                last_error = Some(err);
                continue;
            }

            for model in self.models_to_try(&adapter, &record, &req.model, chain_index).await {
                match self
                    .call_provider(&adapter, &record, &model, req)
                    .await
                {
                    Ok(outcome) => {
                        self.pool
                            .mark_healthy(provider_type, &record.uuid, false, None)
                            .await;
                        return Ok(outcome);
                    }
                    Err(err) => {
                        info!(
                            provider = provider_type.as_str(),
                            uuid = %record.uuid,
                            model,
                            error = %err,
                            "provider attempt failed"
                        );
                        last_error = Some(err);
                    }
                }
            }
            // One unhealthy mark per request per provider, after its models
            // and retries are exhausted.
            let reason = last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string());
            self.pool
                .mark_unhealthy(provider_type, &record.uuid, &reason)
                .await;
        }

        match last_error {
            Some(err) => Err(GatewayError::Provider(err)),
            None => Err(GatewayError::NoProviderAvailable {
                provider_type: self.config.default_provider.as_str().to_string(),
            }),
        }
    }

    /// The requested model on the primary provider; on fallback providers,
    /// substitute through the model mapping when the original is absent.
    async fn models_to_try(
        &self,
        adapter: &Arc<dyn Adapter>,
        record: &ProviderRecord,
        requested: &str,
        chain_index: usize,
    ) -> Vec<String> {
        if chain_index == 0 {
            return vec![requested.to_string()];
        }
        let available = adapter.list_models(record).await;
        if available.iter().any(|m| m == requested) {
            return vec![requested.to_string()];
        }
        let mapped: Vec<String> = self
            .config
            .model_fallback
            .get(requested)
            .cloned()
            .unwrap_or_default();
        if mapped.is_empty() {
            // Nothing mapped: try the original anyway rather than skipping
            // the provider outright.
            vec![requested.to_string()]
        } else {
            mapped
        }
    }

    /// Retry policy within one provider: 429/5xx/network back off
    /// exponentially; 403 earns a single refresh-then-retry; other 4xx stop
    /// immediately.
    async fn call_provider(
        &self,
        adapter: &Arc<dyn Adapter>,
        record: &ProviderRecord,
        model: &str,
        req: &CanonicalRequest,
    ) -> ProviderResult<CallOutcome> {
        let mut refreshed_reactively = false;
        let mut attempt: u32 = 0;
        let mut record = self
            .refresher
            .ensure_fresh(&self.pool, record, self.config.cron_near_window)
            .await?;

        loop {
            let result = if req.stream {
                adapter
                    .stream(&record, model, req)
                    .await
                    .map(CallOutcome::Stream)
            } else {
                adapter
                    .generate(&record, model, req)
                    .await
                    .map(Box::new)
                    .map(CallOutcome::Response)
            };

            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            if err.is_auth_rejection() && !refreshed_reactively {
                refreshed_reactively = true;
                record = self.refresher.refresh_now(&self.pool, &record).await?;
                continue;
            }
            if err.is_retriable() && attempt < self.config.request_max_retries {
                let delay = self.config.request_base_delay * 2u32.saturating_pow(attempt);
                warn!(
                    model,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}

/// Rewrite the terminal usage block: when the adapter could not attribute
/// input tokens (no context-usage signal), substitute the local count.
fn normalize_stream_usage(mut rx: StreamReceiver, local_input: u32) -> StreamReceiver {
    let (tx, out) = tokio::sync::mpsc::channel::<StreamEvent>(32);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let event = match event {
                StreamEvent::Finish { stop_reason, usage } => StreamEvent::Finish {
                    stop_reason,
                    usage: TokenUsage {
                        input_tokens: if usage.input_tokens == 0 {
                            local_input
                        } else {
                            usage.input_tokens
                        },
                        output_tokens: usage.output_tokens,
                    },
                },
                other => other,
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });
    out
}
