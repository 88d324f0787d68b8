//! Gateway core: configuration, inbound auth, the dispatch pipeline with
//! retry and cross-provider fallback, and dialect error rendering.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod system_prompt;

pub use config::{GatewayConfig, SystemPromptMode};
pub use dispatch::Engine;
