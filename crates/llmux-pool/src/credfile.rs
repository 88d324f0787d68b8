//! Credential loading and save-back.
//!
//! A record's credentials come from (in precedence order) its inline fields,
//! a base64-encoded JSON blob, or a JSON file on disk. When the file has
//! JSON siblings in its directory they are merged in as defaults: the target
//! file wins conflicts and `expiresAt` is always taken from the target.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use llmux_common::error::{ProviderError, ProviderResult};

use crate::record::ProviderRecord;

/// Populate the record's credential fields from its configured sources.
/// Inline fields always win; file/blob values only fill gaps.
pub async fn load_credentials(record: &mut ProviderRecord) -> ProviderResult<()> {
    if let Some(blob) = record.cred_base64.clone() {
        let object = decode_blob(&blob)?;
        record.merge_credential_object(&object, false);
    }

    if let Some(path) = record.cred_path.clone() {
        let path = PathBuf::from(path);
        let primary = read_json_object(&path).await?;

        // Primary file first, then siblings as gap-fillers.
        record.merge_credential_object(&primary, false);
        let expiry_before_siblings = record.expires_at.clone();
        for sibling in sibling_json_files(&path).await {
            match read_json_object(&sibling).await {
                Ok(object) => record.merge_credential_object(&object, false),
                Err(err) => {
                    warn!(path = %sibling.display(), error = %err, "skipping unreadable credential sibling");
                }
            }
        }
        // expiresAt belongs to the primary; a sibling's expiry must not
        // shadow an absent one, or the expiry-guard would trust a stale date.
        record.expires_at = expiry_before_siblings;
    }

    if record.has_usable_credential() {
        Ok(())
    } else {
        Err(ProviderError::CredentialMissing(format!(
            "provider {} has neither refreshToken nor accessToken+expiresAt",
            record.uuid
        )))
    }
}

/// Write refreshed tokens back to the credential file, preserving every
/// field the file already had that this process does not model.
pub async fn save_credentials(record: &ProviderRecord) -> ProviderResult<()> {
    let Some(path) = record.cred_path.as_deref() else {
        return Ok(());
    };
    let path = PathBuf::from(path);
    let mut object = read_json_object(&path).await.unwrap_or_default();

    set_opt(&mut object, "accessToken", record.access_token.as_deref());
    set_opt(&mut object, "refreshToken", record.refresh_token.as_deref());
    set_opt(&mut object, "expiresAt", record.expires_at.as_deref());
    set_opt(&mut object, "clientId", record.client_id.as_deref());
    set_opt(&mut object, "clientSecret", record.client_secret.as_deref());
    set_opt(&mut object, "region", record.region.as_deref());
    set_opt(&mut object, "profileArn", record.profile_arn.as_deref());
    set_opt(&mut object, "projectId", record.project_id.as_deref());

    let json = serde_json::to_string_pretty(&JsonValue::Object(object))
        .map_err(|err| ProviderError::Other(err.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json.as_bytes())
        .await
        .map_err(|err| ProviderError::Other(format!("credential write failed: {err}")))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|err| ProviderError::Other(format!("credential rename failed: {err}")))
}

fn set_opt(object: &mut Map<String, JsonValue>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        object.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

fn decode_blob(blob: &str) -> ProviderResult<Map<String, JsonValue>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .map_err(|err| ProviderError::CredentialMissing(format!("bad credBase64: {err}")))?;
    parse_object(&bytes)
}

async fn read_json_object(path: &Path) -> ProviderResult<Map<String, JsonValue>> {
    let raw = tokio::fs::read(path).await.map_err(|err| {
        ProviderError::CredentialMissing(format!("cannot read {}: {err}", path.display()))
    })?;
    parse_object(&raw)
}

fn parse_object(raw: &[u8]) -> ProviderResult<Map<String, JsonValue>> {
    match serde_json::from_slice::<JsonValue>(raw) {
        Ok(JsonValue::Object(object)) => Ok(object),
        Ok(_) => Err(ProviderError::CredentialMissing(
            "credential JSON is not an object".to_string(),
        )),
        Err(err) => Err(ProviderError::CredentialMissing(format!(
            "credential JSON parse error: {err}"
        ))),
    }
}

async fn sibling_json_files(primary: &Path) -> Vec<PathBuf> {
    let Some(dir) = primary.parent() else {
        return Vec::new();
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == primary {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ProviderType;

    fn kiro_record(path: Option<&Path>) -> ProviderRecord {
        let mut record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        record.cred_path = path.map(|p| p.display().to_string());
        record
    }

    #[tokio::test]
    async fn file_load_fills_gaps_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiro.json");
        std::fs::write(
            &path,
            r#"{"refreshToken":"from-file","region":"eu-central-1","expiresAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let mut record = kiro_record(Some(path.as_path()));
        record.region = Some("us-west-2".to_string());
        load_credentials(&mut record).await.unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("from-file"));
        assert_eq!(record.region(), "us-west-2");
    }

    #[tokio::test]
    async fn sibling_merge_target_wins_and_keeps_primary_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("main.json");
        std::fs::write(
            &primary,
            r#"{"refreshToken":"primary","expiresAt":"2026-02-02T00:00:00Z"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("aux.json"),
            r#"{"refreshToken":"aux","clientId":"cid","expiresAt":"2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let mut record = kiro_record(Some(primary.as_path()));
        load_credentials(&mut record).await.unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("primary"));
        assert_eq!(record.client_id.as_deref(), Some("cid"));
        assert_eq!(record.expires_at.as_deref(), Some("2026-02-02T00:00:00Z"));
    }

    #[tokio::test]
    async fn base64_blob_loads() {
        let blob = base64::engine::general_purpose::STANDARD
            .encode(r#"{"refreshToken":"blob-token"}"#);
        let mut record = kiro_record(None);
        record.cred_base64 = Some(blob);
        load_credentials(&mut record).await.unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("blob-token"));
    }

    #[tokio::test]
    async fn empty_sources_fail_with_credential_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, "{}").unwrap();
        let mut record = kiro_record(Some(path.as_path()));
        let err = load_credentials(&mut record).await.unwrap_err();
        assert!(matches!(err, ProviderError::CredentialMissing(_)));
    }

    #[tokio::test]
    async fn save_back_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiro.json");
        std::fs::write(
            &path,
            r#"{"refreshToken":"r","vendorNote":"keep me","expiresAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let mut record = kiro_record(Some(path.as_path()));
        load_credentials(&mut record).await.unwrap();
        record.access_token = Some("fresh".to_string());
        record.expires_at = Some("2026-03-03T00:00:00Z".to_string());
        save_credentials(&record).await.unwrap();
        let saved: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["vendorNote"], "keep me");
        assert_eq!(saved["accessToken"], "fresh");
        assert_eq!(saved["expiresAt"], "2026-03-03T00:00:00Z");
    }
}
