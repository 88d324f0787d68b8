use std::time::Duration;

use tokio::time::timeout;

use llmux_pool::events::{EventHub, PoolEvent};
use llmux_pool::pool::PoolManager;
use llmux_pool::record::{ProviderRecord, ProviderType};

async fn pool_with(uuid: &str) -> (PoolManager, tempfile::TempDir, EventHub) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("provider_pools.json");
    let mut record = ProviderRecord::new(ProviderType::OpenAiIflow);
    record.uuid = uuid.to_string();
    record.refresh_token = Some("rt".to_string());
    let mut doc = serde_json::Map::new();
    doc.insert(
        ProviderType::OpenAiIflow.as_str().to_string(),
        serde_json::json!([record]),
    );
    std::fs::write(
        &path,
        serde_json::to_string_pretty(&serde_json::Value::Object(doc)).unwrap(),
    )
    .unwrap();
    let hub = EventHub::new(16);
    let pool = PoolManager::load(&path, hub.clone(), 2).await.unwrap();
    (pool, dir, hub)
}

#[tokio::test]
async fn health_transitions_reach_subscribers() {
    let (pool, _dir, hub) = pool_with("p1").await;
    let mut rx = hub.subscribe();

    pool.mark_unhealthy(ProviderType::OpenAiIflow, "p1", "timeout")
        .await;
    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PoolEvent::ProviderUnhealthy {
            uuid, error_count, ..
        } => {
            assert_eq!(uuid, "p1");
            assert_eq!(error_count, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    pool.mark_healthy(ProviderType::OpenAiIflow, "p1", true, Some("glm-4.6"))
        .await;
    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        PoolEvent::ProviderHealthy { probe: true, .. }
    ));
}

#[tokio::test]
async fn disable_and_enable_emit_and_gate_selection() {
    let (pool, _dir, hub) = pool_with("p1").await;
    let mut rx = hub.subscribe();

    pool.disable(ProviderType::OpenAiIflow, "p1").await;
    assert!(pool.select(ProviderType::OpenAiIflow).await.is_none());
    assert!(matches!(
        rx.recv().await.unwrap(),
        PoolEvent::ProviderDisabled { .. }
    ));

    pool.enable(ProviderType::OpenAiIflow, "p1").await;
    assert!(pool.select(ProviderType::OpenAiIflow).await.is_some());
    assert!(matches!(
        rx.recv().await.unwrap(),
        PoolEvent::ProviderEnabled { .. }
    ));
}

#[tokio::test]
async fn reload_replaces_state_and_emits() {
    let (pool, dir, hub) = pool_with("p1").await;
    let mut rx = hub.subscribe();

    // Rewrite the file out-of-band with a second record, then reload.
    let mut a = ProviderRecord::new(ProviderType::OpenAiIflow);
    a.uuid = "p1".to_string();
    a.refresh_token = Some("rt".to_string());
    let mut b = ProviderRecord::new(ProviderType::OpenAiIflow);
    b.uuid = "p2".to_string();
    b.refresh_token = Some("rt".to_string());
    let mut doc = serde_json::Map::new();
    doc.insert(
        ProviderType::OpenAiIflow.as_str().to_string(),
        serde_json::json!([a, b]),
    );
    std::fs::write(
        dir.path().join("provider_pools.json"),
        serde_json::to_string_pretty(&serde_json::Value::Object(doc)).unwrap(),
    )
    .unwrap();

    pool.reload().await.unwrap();
    assert_eq!(pool.records_of(ProviderType::OpenAiIflow).await.len(), 2);
    assert!(matches!(
        rx.recv().await.unwrap(),
        PoolEvent::PoolReloaded { providers: 2 }
    ));
}
