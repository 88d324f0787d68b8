//! Kiro usage/quota scraping.

use serde_json::Value as JsonValue;

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_pool::record::ProviderRecord;

use crate::http::{self, HttpCtx};

/// Fetch `getUsageLimits` for the agentic-request resource. A 403 here is
/// surfaced as-is; the caller refreshes once and retries like any other
/// auth rejection.
pub(super) async fn fetch_usage_limits(
    ctx: &HttpCtx,
    url: &str,
    record: &ProviderRecord,
) -> ProviderResult<JsonValue> {
    let access_token = record
        .access_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            ProviderError::CredentialMissing(format!("provider {} has no access token", record.uuid))
        })?;
    let mut full_url = format!("{url}?resourceType=AGENTIC_REQUEST");
    if let Some(profile_arn) = &record.profile_arn {
        full_url.push_str("&profileArn=");
        full_url.push_str(profile_arn);
    }
    let headers = vec![
        ("authorization".to_string(), format!("Bearer {access_token}")),
        ("accept".to_string(), "application/json".to_string()),
    ];
    let bytes = http::get_json(ctx, &full_url, &headers).await?;
    serde_json::from_slice::<JsonValue>(&bytes)
        .map_err(|err| ProviderError::Protocol(format!("usage limits response: {err}")))
}
