use serde::Serialize;
use tokio::sync::broadcast;

use crate::record::ProviderType;

/// Pool state-change notifications. Publishing never blocks; a subscriber
/// that falls behind loses the oldest events (broadcast lagging semantics).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolEvent {
    ProviderHealthy {
        provider_type: ProviderType,
        uuid: String,
        probe: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    ProviderUnhealthy {
        provider_type: ProviderType,
        uuid: String,
        reason: String,
        error_count: u32,
    },
    ProviderDisabled {
        provider_type: ProviderType,
        uuid: String,
    },
    ProviderEnabled {
        provider_type: ProviderType,
        uuid: String,
    },
    TokenRefreshed {
        provider_type: ProviderType,
        uuid: String,
        expires_at: String,
    },
    PoolReloaded {
        providers: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PoolEvent) {
        // No subscribers is fine; the send result is informational only.
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let hub = EventHub::new(4);
        hub.emit(PoolEvent::PoolReloaded { providers: 0 });
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let hub = EventHub::new(2);
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.emit(PoolEvent::PoolReloaded { providers: i });
        }
        // The first recv reports the overflow, later events still arrive.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }
}
