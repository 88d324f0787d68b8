//! Shared leaf types for llmux.
//!
//! This crate carries the error taxonomy and the timestamp helpers used by
//! every other crate. It must stay dependency-light.

pub mod error;
pub mod timefmt;

pub use error::{GatewayError, ProviderError, ProviderResult};
pub use timefmt::{format_rfc3339, now_utc, parse_expires_at};
