//! Wire formats and conversions between the OpenAI and Anthropic APIs.
//!
//! Everything in here is pure (no I/O): request translation, SSE payload
//! decoding, tool-call accumulation, and the plain-text fallback encoding.

pub mod accumulator;
pub mod anthropic_types;
pub mod fallback;
pub mod openai_types;
pub mod repair;
pub mod request;
pub mod response;
pub mod streaming;
