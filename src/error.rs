//! Error types for the bridge.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The request never reached the server (DNS, TLS, connection refused).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx status after all endpoint candidates were tried.
    #[error("{message}")]
    Http { status: u16, message: String },

    /// A single SSE line failed to parse. Recovered where it happens.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The server sent a well-formed error payload inside a 200 stream.
    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("No data received for {}s", after.as_secs())]
    IdleTimeout { after: Duration },

    #[error("Request aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn http(status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    /// Caller-initiated cancellation. Never retried.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
