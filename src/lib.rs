pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod providers;
pub mod retry;
pub mod server;
pub mod translate;

pub use adapter::{GenerationParams, Protocol};
pub use client::{BridgeClient, ChunkStream};
pub use config::{BridgeConfig, ModelResolver, ModelTarget};
pub use error::{BridgeError, Result};
pub use logging::SharedLogger;
pub use orchestrator::{ChatRequest, ModelEvent, ModelUpdate, Orchestrator};
pub use server::{build_router, AppState};
pub use translate::streaming::{StreamChunk, StreamOutcome};
