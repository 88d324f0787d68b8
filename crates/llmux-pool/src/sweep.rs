//! Scheduled background sweeps over the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pool::PoolManager;
use crate::record::ProviderType;
use crate::refresh::TokenRefresher;

/// Periodically refresh every OAuth record whose token expires within
/// `near_window`. Failures are logged and surface later through the
/// per-request expiry guard; the sweep itself never degrades health.
pub fn spawn_refresh_sweep(
    pool: Arc<PoolManager>,
    refresher: Arc<TokenRefresher>,
    period: Duration,
    near_window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for provider_type in ProviderType::ALL {
                if !provider_type.uses_oauth() {
                    continue;
                }
                for record in pool.records_of(provider_type).await {
                    if record.is_disabled || !record.expires_within(near_window) {
                        continue;
                    }
                    debug!(uuid = %record.uuid, "sweep refreshing near-expiry token");
                    if let Err(err) = refresher.ensure_fresh(&pool, &record, near_window).await {
                        warn!(uuid = %record.uuid, error = %err, "scheduled refresh failed");
                    }
                }
            }
        }
    })
}
