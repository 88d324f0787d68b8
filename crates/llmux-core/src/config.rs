use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use llmux_common::error::ProviderError;
use llmux_pool::record::ProviderType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemPromptMode {
    Override,
    Append,
    #[default]
    Off,
}

impl SystemPromptMode {
    fn parse(raw: &str) -> Result<Self, ProviderError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "override" => Ok(SystemPromptMode::Override),
            "append" => Ok(SystemPromptMode::Append),
            "off" | "" => Ok(SystemPromptMode::Off),
            other => Err(ProviderError::InvalidConfig(format!(
                "SYSTEM_PROMPT_MODE must be override|append|off, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub required_api_key: Option<String>,
    pub default_provider: ProviderType,
    pub request_max_retries: u32,
    pub request_base_delay: Duration,
    pub cron_near_window: Duration,
    pub cron_refresh_period: Duration,
    pub provider_pools_path: PathBuf,
    pub max_error_count: u32,
    pub fallback_chain: Vec<ProviderType>,
    pub model_fallback: HashMap<String, Vec<String>>,
    pub proxy_url: Option<String>,
    pub proxy_enabled_providers: HashSet<ProviderType>,
    pub system_prompt_path: Option<PathBuf>,
    pub system_prompt_mode: SystemPromptMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            required_api_key: None,
            default_provider: ProviderType::ClaudeKiroOauth,
            request_max_retries: 3,
            request_base_delay: Duration::from_millis(1000),
            cron_near_window: Duration::from_secs(15 * 60),
            cron_refresh_period: Duration::from_secs(10 * 60),
            provider_pools_path: PathBuf::from("provider_pools.json"),
            max_error_count: 3,
            fallback_chain: Vec::new(),
            model_fallback: HashMap::new(),
            proxy_url: None,
            proxy_enabled_providers: HashSet::new(),
            system_prompt_path: None,
            system_prompt_mode: SystemPromptMode::Off,
        }
    }
}

impl GatewayConfig {
    /// Build from environment variables. Unknown values are a startup
    /// failure, not a silent default.
    pub fn from_env() -> Result<Self, ProviderError> {
        let mut config = Self::default();

        if let Some(host) = env_nonempty("HOST") {
            config.host = host;
        }
        if let Some(port) = env_nonempty("PORT") {
            config.port = port
                .parse()
                .map_err(|_| ProviderError::InvalidConfig(format!("bad PORT {port:?}")))?;
        }
        config.required_api_key = env_nonempty("REQUIRED_API_KEY");
        if let Some(provider) = env_nonempty("MODEL_PROVIDER") {
            config.default_provider = ProviderType::parse(&provider).ok_or_else(|| {
                ProviderError::InvalidConfig(format!("unknown MODEL_PROVIDER {provider:?}"))
            })?;
        }
        if let Some(retries) = env_nonempty("REQUEST_MAX_RETRIES") {
            config.request_max_retries = retries.parse().map_err(|_| {
                ProviderError::InvalidConfig(format!("bad REQUEST_MAX_RETRIES {retries:?}"))
            })?;
        }
        if let Some(delay) = env_nonempty("REQUEST_BASE_DELAY") {
            let millis: u64 = delay.parse().map_err(|_| {
                ProviderError::InvalidConfig(format!("bad REQUEST_BASE_DELAY {delay:?}"))
            })?;
            config.request_base_delay = Duration::from_millis(millis);
        }
        if let Some(minutes) = env_nonempty("CRON_NEAR_MINUTES") {
            let minutes: u64 = minutes.parse().map_err(|_| {
                ProviderError::InvalidConfig(format!("bad CRON_NEAR_MINUTES {minutes:?}"))
            })?;
            config.cron_near_window = Duration::from_secs(minutes * 60);
        }
        if let Some(minutes) = env_nonempty("CRON_REFRESH_TOKEN") {
            let minutes: u64 = minutes.parse().map_err(|_| {
                ProviderError::InvalidConfig(format!("bad CRON_REFRESH_TOKEN {minutes:?}"))
            })?;
            config.cron_refresh_period = Duration::from_secs(minutes * 60);
        }
        if let Some(path) = env_nonempty("PROVIDER_POOLS_FILE_PATH") {
            config.provider_pools_path = PathBuf::from(path);
        }
        if let Some(count) = env_nonempty("MAX_ERROR_COUNT") {
            config.max_error_count = count.parse().map_err(|_| {
                ProviderError::InvalidConfig(format!("bad MAX_ERROR_COUNT {count:?}"))
            })?;
        }
        if let Some(chain) = env_nonempty("PROVIDER_FALLBACK_CHAIN") {
            config.fallback_chain = parse_chain(&chain)?;
        }
        if let Some(mapping) = env_nonempty("MODEL_FALLBACK_MAPPING") {
            config.model_fallback = serde_json::from_str(&mapping).map_err(|err| {
                ProviderError::InvalidConfig(format!("bad MODEL_FALLBACK_MAPPING: {err}"))
            })?;
        }
        config.proxy_url = env_nonempty("PROXY_URL");
        if let Some(providers) = env_nonempty("PROXY_ENABLED_PROVIDERS") {
            config.proxy_enabled_providers = parse_chain(&providers)?.into_iter().collect();
        }
        config.system_prompt_path = env_nonempty("SYSTEM_PROMPT_FILE_PATH").map(PathBuf::from);
        if let Some(mode) = env_nonempty("SYSTEM_PROMPT_MODE") {
            config.system_prompt_mode = SystemPromptMode::parse(&mode)?;
        }
        Ok(config)
    }

    /// Ordered provider chain for one request: default type first, then the
    /// configured fallbacks, deduplicated.
    pub fn provider_chain(&self) -> Vec<ProviderType> {
        let mut chain = vec![self.default_provider];
        for provider in &self.fallback_chain {
            if !chain.contains(provider) {
                chain.push(*provider);
            }
        }
        chain
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_chain(raw: &str) -> Result<Vec<ProviderType>, ProviderError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            ProviderType::parse(item).ok_or_else(|| {
                ProviderError::InvalidConfig(format!("unknown provider type {item:?}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_dedups_and_keeps_default_first() {
        let mut config = GatewayConfig::default();
        config.fallback_chain = vec![
            ProviderType::ClaudeKiroOauth,
            ProviderType::GeminiCliOauth,
            ProviderType::GeminiCliOauth,
        ];
        let chain = config.provider_chain();
        assert_eq!(
            chain,
            vec![ProviderType::ClaudeKiroOauth, ProviderType::GeminiCliOauth]
        );
    }

    #[test]
    fn parse_chain_rejects_unknown_types() {
        assert!(parse_chain("claude-kiro-oauth, bogus").is_err());
        assert_eq!(
            parse_chain("claude-kiro-oauth,openai-iflow").unwrap(),
            vec![ProviderType::ClaudeKiroOauth, ProviderType::OpenAiIflow]
        );
    }
}
