//! Wire DTOs for the three inbound/outbound dialects.
//!
//! These structs mirror each vendor's JSON shapes and nothing else; canonical
//! conversion lives in `llmux-transform`. Unknown fields are tolerated on
//! deserialize and never round-tripped.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;
