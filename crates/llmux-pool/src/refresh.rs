//! Token refresh: per-provider refresh protocols behind a transport seam,
//! serialized per record so concurrent callers trigger one HTTP exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::info;

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_common::timefmt::{format_rfc3339, now_utc};

use crate::credfile;
use crate::events::PoolEvent;
use crate::pool::PoolManager;
use crate::record::{AuthMethod, ProviderRecord, ProviderType};

/// Minimal HTTP surface the refresher needs. Implemented over the real
/// client in `llmux-upstream`; tests substitute a double.
#[async_trait]
pub trait RefreshHttp: Send + Sync {
    async fn post_json(&self, url: &str, body: JsonValue) -> ProviderResult<(u16, JsonValue)>;
}

/// Refresh endpoint templates; `{region}` is substituted per record.
#[derive(Debug, Clone)]
pub struct RefreshEndpoints {
    pub kiro_social: String,
    pub kiro_idc: String,
    pub google_token: String,
    pub qwen_token: String,
    pub iflow_token: String,
}

impl Default for RefreshEndpoints {
    fn default() -> Self {
        Self {
            kiro_social: "https://prod.{region}.auth.desktop.kiro.dev/refreshToken".to_string(),
            kiro_idc: "https://oidc.{region}.amazonaws.com/token".to_string(),
            google_token: "https://oauth2.googleapis.com/token".to_string(),
            qwen_token: "https://chat.qwen.ai/api/v1/oauth2/token".to_string(),
            iflow_token: "https://iflow.cn/oauth/token".to_string(),
        }
    }
}

fn with_region(template: &str, region: &str) -> String {
    template.replace("{region}", region)
}

pub struct TokenRefresher {
    http: Arc<dyn RefreshHttp>,
    endpoints: RefreshEndpoints,
    // One lock per record uuid; refreshes for different records run freely.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(http: Arc<dyn RefreshHttp>, endpoints: RefreshEndpoints) -> Self {
        Self {
            http,
            endpoints,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, uuid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Expiry-guard entry point: refresh only when the token expires inside
    /// `window`. Returns the (possibly updated) record to use for the call.
    pub async fn ensure_fresh(
        &self,
        pool: &PoolManager,
        record: &ProviderRecord,
        window: Duration,
    ) -> ProviderResult<ProviderRecord> {
        if !record.provider_type.uses_oauth() || !record.expires_within(window) {
            return Ok(record.clone());
        }
        self.refresh(pool, record, window).await
    }

    /// Unconditional refresh (reactive 403 path).
    pub async fn refresh_now(
        &self,
        pool: &PoolManager,
        record: &ProviderRecord,
    ) -> ProviderResult<ProviderRecord> {
        if !record.provider_type.uses_oauth() {
            return Ok(record.clone());
        }
        self.refresh(pool, record, Duration::ZERO).await
    }

    async fn refresh(
        &self,
        pool: &PoolManager,
        record: &ProviderRecord,
        window: Duration,
    ) -> ProviderResult<ProviderRecord> {
        let lock = self.lock_for(&record.uuid).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent caller may have refreshed
        // while this one waited.
        let current = pool
            .get(record.provider_type, &record.uuid)
            .await
            .unwrap_or_else(|| record.clone());
        if window > Duration::ZERO && !current.expires_within(window) {
            return Ok(current);
        }

        let (url, body) = self.build_exchange(&current)?;
        let (status, payload) = self.http.post_json(&url, body).await?;
        let updated = apply_refresh_response(&current, status, &payload)?;

        pool.update_record(current.provider_type, &current.uuid, {
            let updated = updated.clone();
            move |live| {
                live.access_token = updated.access_token.clone();
                if updated.refresh_token.is_some() {
                    live.refresh_token = updated.refresh_token.clone();
                }
                live.expires_at = updated.expires_at.clone();
                if updated.profile_arn.is_some() {
                    live.profile_arn = updated.profile_arn.clone();
                }
            }
        })
        .await;
        if let Err(err) = credfile::save_credentials(&updated).await {
            tracing::warn!(uuid = %updated.uuid, error = %err, "credential save-back failed");
        }
        pool.events().emit(PoolEvent::TokenRefreshed {
            provider_type: updated.provider_type,
            uuid: updated.uuid.clone(),
            expires_at: updated.expires_at.clone().unwrap_or_default(),
        });
        info!(uuid = %updated.uuid, provider = updated.provider_type.as_str(), "token refreshed");
        Ok(updated)
    }

    fn build_exchange(&self, record: &ProviderRecord) -> ProviderResult<(String, JsonValue)> {
        let refresh_token = record
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ProviderError::CredentialMissing(format!(
                    "provider {} has no refresh token",
                    record.uuid
                ))
            })?;
        let region = record.region();
        match record.provider_type {
            ProviderType::ClaudeKiroOauth => match record.auth_method {
                Some(AuthMethod::Idc) => Ok((
                    with_region(&self.endpoints.kiro_idc, region),
                    serde_json::json!({
                        "refreshToken": refresh_token,
                        "clientId": record.client_id,
                        "clientSecret": record.client_secret,
                        "grantType": "refresh_token",
                    }),
                )),
                _ => Ok((
                    with_region(&self.endpoints.kiro_social, region),
                    serde_json::json!({ "refreshToken": refresh_token }),
                )),
            },
            ProviderType::GeminiCliOauth | ProviderType::GeminiAntigravity => Ok((
                self.endpoints.google_token.clone(),
                serde_json::json!({
                    "client_id": record.client_id,
                    "client_secret": record.client_secret,
                    "refresh_token": refresh_token,
                    "grant_type": "refresh_token",
                }),
            )),
            ProviderType::OpenAiQwenOauth => Ok((
                self.endpoints.qwen_token.clone(),
                serde_json::json!({
                    "client_id": record.client_id,
                    "refresh_token": refresh_token,
                    "grant_type": "refresh_token",
                }),
            )),
            ProviderType::OpenAiIflow => Ok((
                self.endpoints.iflow_token.clone(),
                serde_json::json!({
                    "client_id": record.client_id,
                    "client_secret": record.client_secret,
                    "refresh_token": refresh_token,
                    "grant_type": "refresh_token",
                }),
            )),
            ProviderType::OpenAiCustom | ProviderType::ClaudeCustom => Err(
                ProviderError::NotSupported("key-based providers do not refresh"),
            ),
        }
    }
}

fn apply_refresh_response(
    record: &ProviderRecord,
    status: u16,
    payload: &JsonValue,
) -> ProviderResult<ProviderRecord> {
    let access_token = string_field(payload, &["accessToken", "access_token"]);
    let Some(access_token) = access_token else {
        return Err(ProviderError::RefreshFailed {
            status,
            provider_uuid: record.uuid.clone(),
        });
    };

    let mut updated = record.clone();
    updated.access_token = Some(access_token);
    if let Some(refresh_token) = string_field(payload, &["refreshToken", "refresh_token"]) {
        updated.refresh_token = Some(refresh_token);
    }
    if let Some(profile_arn) = string_field(payload, &["profileArn", "profile_arn"]) {
        updated.profile_arn = Some(profile_arn);
    }
    let expires_in = payload
        .get("expiresIn")
        .or_else(|| payload.get("expires_in"))
        .and_then(JsonValue::as_i64)
        .unwrap_or(3600);
    updated.expires_at = Some(format_rfc3339(
        now_utc() + time::Duration::seconds(expires_in),
    ));
    Ok(updated)
}

fn string_field(payload: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .filter_map(JsonValue::as_str)
        .map(str::to_string)
        .find(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHttp {
        calls: AtomicU32,
        response: JsonValue,
    }

    #[async_trait]
    impl RefreshHttp for CountingHttp {
        async fn post_json(&self, _url: &str, _body: JsonValue) -> ProviderResult<(u16, JsonValue)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Let concurrent callers pile up on the per-record lock.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok((200, self.response.clone()))
        }
    }

    async fn pool_with_record(record: ProviderRecord) -> (Arc<PoolManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pools.json");
        let mut doc = serde_json::Map::new();
        doc.insert(
            record.provider_type.as_str().to_string(),
            serde_json::json!([record]),
        );
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&serde_json::Value::Object(doc)).unwrap(),
        )
        .unwrap();
        let pool = PoolManager::load(&path, EventHub::default(), 3).await.unwrap();
        (Arc::new(pool), dir)
    }

    fn stale_kiro() -> ProviderRecord {
        let mut record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        record.uuid = "kiro-1".to_string();
        record.refresh_token = Some("rt".to_string());
        record.expires_at = Some("2020-01-01T00:00:00Z".to_string());
        record
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_stale_callers_trigger_one_refresh() {
        let (pool, _dir) = pool_with_record(stale_kiro()).await;
        let http = Arc::new(CountingHttp {
            calls: AtomicU32::new(0),
            response: serde_json::json!({"accessToken": "fresh", "expiresIn": 3600}),
        });
        let refresher = Arc::new(TokenRefresher::new(
            http.clone(),
            RefreshEndpoints::default(),
        ));
        let record = pool.get(ProviderType::ClaudeKiroOauth, "kiro-1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let refresher = refresher.clone();
            let pool = pool.clone();
            let record = record.clone();
            handles.push(tokio::spawn(async move {
                refresher
                    .ensure_fresh(&pool, &record, Duration::from_secs(900))
                    .await
            }));
        }
        for handle in handles {
            let updated = handle.await.unwrap().unwrap();
            assert_eq!(updated.access_token.as_deref(), Some("fresh"));
        }
        assert_eq!(http.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_without_access_token_fails_typed() {
        let (pool, _dir) = pool_with_record(stale_kiro()).await;
        let http = Arc::new(CountingHttp {
            calls: AtomicU32::new(0),
            response: serde_json::json!({"error": "invalid_grant"}),
        });
        let refresher = TokenRefresher::new(http, RefreshEndpoints::default());
        let record = pool.get(ProviderType::ClaudeKiroOauth, "kiro-1").await.unwrap();
        let err = refresher.refresh_now(&pool, &record).await.unwrap_err();
        match err {
            ProviderError::RefreshFailed { provider_uuid, .. } => {
                assert_eq!(provider_uuid, "kiro-1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let mut record = stale_kiro();
        record.expires_at = Some(format_rfc3339(now_utc() + time::Duration::hours(6)));
        let (pool, _dir) = pool_with_record(record.clone()).await;
        let http = Arc::new(CountingHttp {
            calls: AtomicU32::new(0),
            response: serde_json::json!({}),
        });
        let refresher = TokenRefresher::new(http.clone(), RefreshEndpoints::default());
        refresher
            .ensure_fresh(&pool, &record, Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(http.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn kiro_idc_uses_client_credentials_grant_body() {
        let mut record = stale_kiro();
        record.auth_method = Some(AuthMethod::Idc);
        record.client_id = Some("cid".to_string());
        record.client_secret = Some("sec".to_string());
        let refresher = TokenRefresher::new(
            Arc::new(CountingHttp {
                calls: AtomicU32::new(0),
                response: serde_json::json!({}),
            }),
            RefreshEndpoints::default(),
        );
        let (url, body) = refresher.build_exchange(&record).unwrap();
        assert_eq!(url, "https://oidc.us-east-1.amazonaws.com/token");
        assert_eq!(body["grantType"], "refresh_token");
        assert_eq!(body["clientId"], "cid");
    }
}
