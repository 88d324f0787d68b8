use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

use llmux_common::timefmt::{format_rfc3339, now_utc, parse_expires_at};

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "claude-kiro-oauth")]
    ClaudeKiroOauth,
    #[serde(rename = "gemini-cli-oauth")]
    GeminiCliOauth,
    #[serde(rename = "gemini-antigravity")]
    GeminiAntigravity,
    #[serde(rename = "openai-qwen-oauth")]
    OpenAiQwenOauth,
    #[serde(rename = "openai-iflow")]
    OpenAiIflow,
    #[serde(rename = "openai-custom")]
    OpenAiCustom,
    #[serde(rename = "claude-custom")]
    ClaudeCustom,
}

impl ProviderType {
    pub const ALL: [ProviderType; 7] = [
        ProviderType::ClaudeKiroOauth,
        ProviderType::GeminiCliOauth,
        ProviderType::GeminiAntigravity,
        ProviderType::OpenAiQwenOauth,
        ProviderType::OpenAiIflow,
        ProviderType::OpenAiCustom,
        ProviderType::ClaudeCustom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::ClaudeKiroOauth => "claude-kiro-oauth",
            ProviderType::GeminiCliOauth => "gemini-cli-oauth",
            ProviderType::GeminiAntigravity => "gemini-antigravity",
            ProviderType::OpenAiQwenOauth => "openai-qwen-oauth",
            ProviderType::OpenAiIflow => "openai-iflow",
            ProviderType::OpenAiCustom => "openai-custom",
            ProviderType::ClaudeCustom => "claude-custom",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == raw)
    }

    /// The native wire dialect this provider speaks upstream.
    pub fn dialect(&self) -> WireDialect {
        match self {
            ProviderType::ClaudeKiroOauth | ProviderType::ClaudeCustom => WireDialect::Claude,
            ProviderType::GeminiCliOauth | ProviderType::GeminiAntigravity => WireDialect::Gemini,
            ProviderType::OpenAiQwenOauth
            | ProviderType::OpenAiIflow
            | ProviderType::OpenAiCustom => WireDialect::OpenAi,
        }
    }

    /// OAuth-backed types refresh; key-based types never do.
    pub fn uses_oauth(&self) -> bool {
        !matches!(
            self,
            ProviderType::OpenAiCustom | ProviderType::ClaudeCustom
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireDialect {
    OpenAi,
    Claude,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Social,
    Idc,
}

/// One credentialed upstream account plus its runtime state, as persisted in
/// `provider_pools.json`. Unknown fields survive a load/save cycle through
/// the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    #[serde(default)]
    pub uuid: String,
    /// May be omitted in the pool file, where the pool key carries it; the
    /// loader stamps it back in.
    #[serde(default = "default_provider_type")]
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,

    // Credential source: a file path, a base64 blob, or the inline fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_base64: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<AuthMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    // Runtime state.
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_model: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_true() -> bool {
    true
}

fn default_provider_type() -> ProviderType {
    ProviderType::OpenAiCustom
}

impl ProviderRecord {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            provider_type,
            custom_name: None,
            cred_path: None,
            cred_base64: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            client_id: None,
            client_secret: None,
            auth_method: None,
            region: None,
            profile_arn: None,
            project_id: None,
            api_key: None,
            base_url: None,
            is_healthy: true,
            is_disabled: false,
            error_count: 0,
            last_error_time: None,
            last_used: None,
            usage_count: 0,
            last_health_check_time: None,
            last_health_check_model: None,
            extra: Map::new(),
        }
    }

    /// Stable identity is required before a record enters a pool.
    pub fn ensure_uuid(&mut self) {
        if self.uuid.trim().is_empty() {
            self.uuid = uuid::Uuid::new_v4().to_string();
        }
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    pub fn is_selectable(&self) -> bool {
        !self.is_disabled && self.is_healthy
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at.as_deref().and_then(parse_expires_at)
    }

    /// Expiry-guard: true when the token is missing, already expired, or
    /// expires within `window`.
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at() {
            Some(at) => {
                let remaining = at - now_utc();
                remaining.whole_seconds() < window.as_secs() as i64
            }
            None => true,
        }
    }

    pub fn touch_used(&mut self) {
        self.last_used = Some(format_rfc3339(now_utc()));
    }

    /// True when the record (after credential loading) can authenticate at
    /// all: a refresh token, or an access token with a known expiry.
    pub fn has_usable_credential(&self) -> bool {
        if !self.provider_type.uses_oauth() {
            return self.api_key.as_deref().is_some_and(|k| !k.is_empty());
        }
        if self.refresh_token.as_deref().is_some_and(|t| !t.is_empty()) {
            return true;
        }
        self.access_token.as_deref().is_some_and(|t| !t.is_empty()) && self.expires_at.is_some()
    }

    /// Merge credential fields from a raw JSON object (credential file or
    /// base64 blob). Existing values win unless `overwrite` is set.
    pub fn merge_credential_object(&mut self, object: &Map<String, JsonValue>, overwrite: bool) {
        merge_str(&mut self.access_token, object, "accessToken", overwrite);
        merge_str(&mut self.refresh_token, object, "refreshToken", overwrite);
        merge_str(&mut self.expires_at, object, "expiresAt", overwrite);
        merge_str(&mut self.client_id, object, "clientId", overwrite);
        merge_str(&mut self.client_secret, object, "clientSecret", overwrite);
        merge_str(&mut self.region, object, "region", overwrite);
        merge_str(&mut self.profile_arn, object, "profileArn", overwrite);
        merge_str(&mut self.project_id, object, "projectId", overwrite);
        if (self.auth_method.is_none() || overwrite)
            && let Some(JsonValue::String(method)) = object.get("authMethod")
        {
            self.auth_method = match method.as_str() {
                "idc" => Some(AuthMethod::Idc),
                "social" => Some(AuthMethod::Social),
                _ => self.auth_method,
            };
        }
    }
}

fn merge_str(
    slot: &mut Option<String>,
    object: &Map<String, JsonValue>,
    key: &str,
    overwrite: bool,
) {
    if slot.is_some() && !overwrite {
        return;
    }
    if let Some(value) = object.get(key) {
        let text = match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        };
        if let Some(text) = text
            && !text.is_empty()
        {
            *slot = Some(text);
        }
    }
}
