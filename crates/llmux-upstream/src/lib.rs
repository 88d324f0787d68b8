//! Concrete upstream adapters and their shared HTTP plumbing.
//!
//! Each vendor module implements the pool's [`Adapter`] contract over the
//! shared `wreq` client. The Kiro module carries the event-stream decoder
//! and the bracket tool-call parser.

pub mod claude_compat;
pub mod counting;
pub mod geminicli;
pub mod http;
pub mod kiro;
pub mod openai_like;
pub mod registry;

pub use http::{HttpCtx, WreqRefreshHttp};
pub use registry::AdapterRegistry;
