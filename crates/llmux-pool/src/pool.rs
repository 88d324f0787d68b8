use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use llmux_common::error::{ProviderError, ProviderResult};
use llmux_common::timefmt::{format_rfc3339, now_utc};

use crate::events::{EventHub, PoolEvent};
use crate::record::{ProviderRecord, ProviderType};

/// Persisted pool document: `providerType → ordered record list`.
type PoolMap = BTreeMap<String, Vec<ProviderRecord>>;

/// Owner of all provider state. Reads go through the `RwLock`; every
/// mutation updates memory first and then rewrites the pool file. A failed
/// write is logged and not rolled back.
pub struct PoolManager {
    pools: RwLock<PoolMap>,
    path: PathBuf,
    write_gate: Mutex<()>,
    events: EventHub,
    max_error_count: u32,
}

impl PoolManager {
    pub async fn load(
        path: impl Into<PathBuf>,
        events: EventHub,
        max_error_count: u32,
    ) -> ProviderResult<Self> {
        let path = path.into();
        let pools = read_pool_file(&path).await?;
        let manager = Self {
            pools: RwLock::new(pools),
            path,
            write_gate: Mutex::new(()),
            events,
            max_error_count,
        };
        manager.hydrate().await;
        Ok(manager)
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Assign uuids to records that arrived without one and pull file/blob
    /// credentials into the in-memory records. Load failures are logged; the
    /// record stays and fails at selection-to-call time instead.
    async fn hydrate(&self) {
        let mut changed = false;
        {
            let mut pools = self.pools.write().await;
            for records in pools.values_mut() {
                for record in records.iter_mut() {
                    if record.uuid.trim().is_empty() {
                        record.ensure_uuid();
                        changed = true;
                    }
                    if record.cred_path.is_some() || record.cred_base64.is_some() {
                        if let Err(err) = crate::credfile::load_credentials(record).await {
                            warn!(uuid = %record.uuid, error = %err, "credential load failed");
                        }
                    }
                }
            }
        }
        if changed {
            self.persist().await;
        }
    }

    /// Least-recently-used selection among enabled, healthy records of the
    /// requested type. `lastUsed` is bumped at selection time so concurrent
    /// selectors spread across the pool.
    pub async fn select(&self, provider_type: ProviderType) -> Option<ProviderRecord> {
        let mut pools = self.pools.write().await;
        let records = pools.get_mut(provider_type.as_str())?;
        let chosen = records
            .iter_mut()
            .filter(|record| record.is_selectable())
            .min_by_key(|record| record.last_used.clone().unwrap_or_default())?;
        chosen.touch_used();
        chosen.usage_count += 1;
        Some(chosen.clone())
    }

    pub async fn records_of(&self, provider_type: ProviderType) -> Vec<ProviderRecord> {
        self.pools
            .read()
            .await
            .get(provider_type.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, provider_type: ProviderType, uuid: &str) -> Option<ProviderRecord> {
        self.pools
            .read()
            .await
            .get(provider_type.as_str())?
            .iter()
            .find(|record| record.uuid == uuid)
            .cloned()
    }

    /// Provider types that currently have at least one enabled record.
    pub async fn active_types(&self) -> Vec<ProviderType> {
        let pools = self.pools.read().await;
        ProviderType::ALL
            .into_iter()
            .filter(|t| {
                pools
                    .get(t.as_str())
                    .is_some_and(|records| records.iter().any(|r| !r.is_disabled))
            })
            .collect()
    }

    /// A successful call (or probe) restores health and zeroes the error
    /// counter. This and `mark_unhealthy` are the only writers of
    /// `isHealthy`.
    pub async fn mark_healthy(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        probe: bool,
        model: Option<&str>,
    ) {
        let mut state_changed = false;
        {
            let mut pools = self.pools.write().await;
            if let Some(record) = find_mut(&mut pools, provider_type, uuid) {
                state_changed = !record.is_healthy || record.error_count > 0;
                record.is_healthy = true;
                record.error_count = 0;
                if probe {
                    record.last_health_check_time = Some(format_rfc3339(now_utc()));
                    record.last_health_check_model = model.map(str::to_string);
                }
            }
        }
        if state_changed {
            self.persist().await;
            self.events.emit(PoolEvent::ProviderHealthy {
                provider_type,
                uuid: uuid.to_string(),
                probe,
                model: model.map(str::to_string),
            });
        }
    }

    /// Count an upstream failure; at `MAX_ERROR_COUNT` the record degrades
    /// to unhealthy and leaves the selection set.
    pub async fn mark_unhealthy(&self, provider_type: ProviderType, uuid: &str, reason: &str) {
        let mut emitted: Option<u32> = None;
        {
            let mut pools = self.pools.write().await;
            if let Some(record) = find_mut(&mut pools, provider_type, uuid) {
                record.error_count += 1;
                record.last_error_time = Some(format_rfc3339(now_utc()));
                if record.error_count >= self.max_error_count {
                    record.is_healthy = false;
                }
                emitted = Some(record.error_count);
            }
        }
        if let Some(error_count) = emitted {
            self.persist().await;
            self.events.emit(PoolEvent::ProviderUnhealthy {
                provider_type,
                uuid: uuid.to_string(),
                reason: reason.to_string(),
                error_count,
            });
            debug!(
                provider = provider_type.as_str(),
                uuid, reason, error_count, "provider marked unhealthy"
            );
        }
    }

    pub async fn disable(&self, provider_type: ProviderType, uuid: &str) {
        if self
            .set_disabled_flag(provider_type, uuid, true)
            .await
        {
            self.persist().await;
            self.events.emit(PoolEvent::ProviderDisabled {
                provider_type,
                uuid: uuid.to_string(),
            });
        }
    }

    pub async fn enable(&self, provider_type: ProviderType, uuid: &str) {
        if self
            .set_disabled_flag(provider_type, uuid, false)
            .await
        {
            self.persist().await;
            self.events.emit(PoolEvent::ProviderEnabled {
                provider_type,
                uuid: uuid.to_string(),
            });
        }
    }

    async fn set_disabled_flag(
        &self,
        provider_type: ProviderType,
        uuid: &str,
        disabled: bool,
    ) -> bool {
        let mut pools = self.pools.write().await;
        match find_mut(&mut pools, provider_type, uuid) {
            Some(record) if record.is_disabled != disabled => {
                record.is_disabled = disabled;
                true
            }
            _ => false,
        }
    }

    /// Restore every record of a type to healthy with a clean error counter.
    pub async fn reset_health(&self, provider_type: ProviderType) {
        {
            let mut pools = self.pools.write().await;
            if let Some(records) = pools.get_mut(provider_type.as_str()) {
                for record in records.iter_mut() {
                    record.is_healthy = true;
                    record.error_count = 0;
                }
            }
        }
        self.persist().await;
    }

    /// Apply a credential update (post-refresh) to the stored record and
    /// persist. The closure sees the live record.
    pub async fn update_record<F>(&self, provider_type: ProviderType, uuid: &str, apply: F)
    where
        F: FnOnce(&mut ProviderRecord),
    {
        {
            let mut pools = self.pools.write().await;
            if let Some(record) = find_mut(&mut pools, provider_type, uuid) {
                apply(record);
            }
        }
        self.persist().await;
    }

    /// Probe every enabled record of a type with the supplied async check.
    /// The probe returns the model it answered with; failures degrade the
    /// record. Probes never touch `usageCount`.
    pub async fn check_health<F, Fut>(
        &self,
        provider_type: ProviderType,
        force: bool,
        probe: F,
    ) -> Vec<crate::adapter::HealthReport>
    where
        F: Fn(ProviderRecord) -> Fut,
        Fut: std::future::Future<Output = ProviderResult<String>>,
    {
        let records = self.records_of(provider_type).await;
        let mut reports = Vec::new();
        for record in records {
            if record.is_disabled {
                continue;
            }
            if !force && record.is_healthy && record.error_count == 0 {
                reports.push(crate::adapter::HealthReport {
                    uuid: record.uuid.clone(),
                    ok: true,
                    model: record.last_health_check_model.clone(),
                    error: None,
                });
                continue;
            }
            let uuid = record.uuid.clone();
            match probe(record).await {
                Ok(model) => {
                    self.mark_healthy(provider_type, &uuid, true, Some(&model))
                        .await;
                    reports.push(crate::adapter::HealthReport {
                        uuid,
                        ok: true,
                        model: Some(model),
                        error: None,
                    });
                }
                Err(err) => {
                    self.mark_unhealthy(provider_type, &uuid, &err.to_string())
                        .await;
                    reports.push(crate::adapter::HealthReport {
                        uuid,
                        ok: false,
                        model: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        reports
    }

    /// Re-read the pool file, replacing in-memory state.
    pub async fn reload(&self) -> ProviderResult<()> {
        let fresh = read_pool_file(&self.path).await?;
        let total = fresh.values().map(Vec::len).sum();
        *self.pools.write().await = fresh;
        self.hydrate().await;
        self.events.emit(PoolEvent::PoolReloaded { providers: total });
        Ok(())
    }

    /// Serialize the in-memory map and rewrite the pool file atomically.
    /// Serialized behind `write_gate`; last writer wins.
    pub async fn persist(&self) {
        let _gate = self.write_gate.lock().await;
        let snapshot = self.pools.read().await.clone();
        if let Err(err) = write_pool_file(&self.path, &snapshot).await {
            warn!(path = %self.path.display(), error = %err, "pool file write failed");
        }
    }
}

fn find_mut<'a>(
    pools: &'a mut PoolMap,
    provider_type: ProviderType,
    uuid: &str,
) -> Option<&'a mut ProviderRecord> {
    pools
        .get_mut(provider_type.as_str())?
        .iter_mut()
        .find(|record| record.uuid == uuid)
}

async fn read_pool_file(path: &Path) -> ProviderResult<PoolMap> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(PoolMap::new()),
        Err(err) => {
            return Err(ProviderError::Other(format!(
                "cannot read pool file {}: {err}",
                path.display()
            )));
        }
    };
    let parsed: BTreeMap<String, JsonValue> = serde_json::from_slice(&raw)
        .map_err(|err| ProviderError::Other(format!("pool file is not valid JSON: {err}")))?;
    let mut pools = PoolMap::new();
    for (key, value) in parsed {
        // Unknown provider-type keys are preserved verbatim? No: they cannot
        // be represented as records, so they are rejected loudly instead of
        // silently dropped on the next write.
        let Some(provider_type) = ProviderType::parse(&key) else {
            return Err(ProviderError::Other(format!(
                "unknown provider type {key:?} in pool file"
            )));
        };
        let mut records: Vec<ProviderRecord> = serde_json::from_value(value).map_err(|err| {
            ProviderError::Other(format!("bad records for {key}: {err}"))
        })?;
        for record in records.iter_mut() {
            record.provider_type = provider_type;
        }
        pools.insert(key, records);
    }
    Ok(pools)
}

async fn write_pool_file(path: &Path, pools: &PoolMap) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(pools).unwrap_or_else(|_| "{}".to_string());
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with(records: Vec<ProviderRecord>) -> (PoolManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider_pools.json");
        let mut pools = PoolMap::new();
        pools.insert(
            ProviderType::ClaudeKiroOauth.as_str().to_string(),
            records,
        );
        write_pool_file(&path, &pools).await.unwrap();
        let manager = PoolManager::load(&path, EventHub::default(), 3)
            .await
            .unwrap();
        (manager, dir)
    }

    fn record(uuid: &str) -> ProviderRecord {
        let mut record = ProviderRecord::new(ProviderType::ClaudeKiroOauth);
        record.uuid = uuid.to_string();
        record
    }

    #[tokio::test]
    async fn disabled_records_are_never_selected() {
        let mut p2 = record("b");
        p2.is_disabled = true;
        let (manager, _dir) = manager_with(vec![record("a"), p2]).await;
        for _ in 0..100 {
            let chosen = manager.select(ProviderType::ClaudeKiroOauth).await.unwrap();
            assert_eq!(chosen.uuid, "a");
        }
    }

    #[tokio::test]
    async fn selection_rotates_least_recently_used() {
        let (manager, _dir) = manager_with(vec![record("a"), record("b"), record("c")]).await;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..9 {
            let chosen = manager.select(ProviderType::ClaudeKiroOauth).await.unwrap();
            *counts.entry(chosen.uuid).or_insert(0) += 1;
            // lastUsed has second resolution in RFC-3339; nudge the clock by
            // yielding so ordering stays deterministic via usage fallback.
        }
        // Every provider within ceil(9/3)+1 selections of each other.
        for count in counts.values() {
            assert!(*count <= 4, "unfair selection: {counts:?}");
        }
    }

    #[tokio::test]
    async fn error_count_threshold_degrades_health() {
        let (manager, _dir) = manager_with(vec![record("a")]).await;
        for _ in 0..2 {
            manager
                .mark_unhealthy(ProviderType::ClaudeKiroOauth, "a", "boom")
                .await;
        }
        let rec = manager.get(ProviderType::ClaudeKiroOauth, "a").await.unwrap();
        assert!(rec.is_healthy);
        manager
            .mark_unhealthy(ProviderType::ClaudeKiroOauth, "a", "boom")
            .await;
        let rec = manager.get(ProviderType::ClaudeKiroOauth, "a").await.unwrap();
        assert!(!rec.is_healthy);
        assert_eq!(rec.error_count, 3);

        manager
            .mark_healthy(ProviderType::ClaudeKiroOauth, "a", false, None)
            .await;
        let rec = manager.get(ProviderType::ClaudeKiroOauth, "a").await.unwrap();
        assert!(rec.is_healthy);
        assert_eq!(rec.error_count, 0);
    }

    #[tokio::test]
    async fn persisted_file_matches_memory_after_mutation() {
        let (manager, dir) = manager_with(vec![record("a")]).await;
        manager.disable(ProviderType::ClaudeKiroOauth, "a").await;
        let on_disk = tokio::fs::read_to_string(dir.path().join("provider_pools.json"))
            .await
            .unwrap();
        let parsed: JsonValue = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed["claude-kiro-oauth"][0]["isDisabled"], true);
        // 2-space indentation on disk.
        assert!(on_disk.contains("\n  \"claude-kiro-oauth\""));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PoolManager::load(
            dir.path().join("absent.json"),
            EventHub::default(),
            3,
        )
        .await
        .unwrap();
        assert!(manager.select(ProviderType::ClaudeKiroOauth).await.is_none());
    }
}
