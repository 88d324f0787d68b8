//! Provider pool runtime: records, selection, health accounting, credential
//! loading, token refresh, and the pool event hub.
//!
//! This crate performs no HTTP itself; the refresher talks through the
//! [`RefreshHttp`] seam and adapters implement [`Adapter`] elsewhere, so the
//! pool layer stays testable without a network.

pub mod adapter;
pub mod credfile;
pub mod events;
pub mod pool;
pub mod record;
pub mod refresh;
pub mod sweep;

pub use adapter::{Adapter, HealthReport, StreamReceiver};
pub use events::{EventHub, PoolEvent};
pub use pool::PoolManager;
pub use record::{AuthMethod, ProviderRecord, ProviderType, WireDialect};
pub use refresh::{RefreshEndpoints, RefreshHttp, TokenRefresher};
