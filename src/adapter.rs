//! Per-protocol request building and response decoding.
//!
//! The client picks one [`ProtocolAdapter`] per attempt with [`adapter_for`]
//! and never branches on the protocol again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ModelTarget;
use crate::error::{BridgeError, Result};
use crate::translate::anthropic_types::MessagesRequest;
use crate::translate::openai_types::{ChatCompletionRequest, ChatMessage, ChatTool, StreamOptions};
use crate::translate::request::{to_anthropic, to_anthropic_tools};
use crate::translate::response::{anthropic_complete, openai_complete};
use crate::translate::streaming::{AnthropicDecoder, OpenAiDecoder, StreamChunk, StreamDecoder};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 4096;

const OPENAI_SUFFIX: &str = "/chat/completions";
const ANTHROPIC_SUFFIX: &str = "/messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::OpenAi => "openai",
            Protocol::Anthropic => "anthropic",
        })
    }
}

impl FromStr for Protocol {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Protocol::OpenAi),
            "anthropic" => Ok(Protocol::Anthropic),
            other => Err(BridgeError::config(format!(
                "Unknown protocol '{other}'. Expected 'openai' or 'anthropic'"
            ))),
        }
    }
}

/// Sampling parameters shared by every attempt of one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatTool>,
}

pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Ordered request URLs to try for this target.
    fn endpoint_candidates(&self, target: &ModelTarget) -> Vec<String>;

    fn request_body(
        &self,
        target: &ModelTarget,
        params: &GenerationParams,
        messages: &[ChatMessage],
    ) -> Result<serde_json::Value>;

    fn apply_headers(&self, builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder;

    /// Fresh decoder for one stream attempt.
    fn decoder(&self) -> Box<dyn StreamDecoder>;

    /// Decode a complete JSON response from a server that did not stream.
    fn decode_complete(&self, value: serde_json::Value) -> Result<Option<StreamChunk>>;
}

#[must_use]
pub fn adapter_for(protocol: Protocol) -> &'static dyn ProtocolAdapter {
    match protocol {
        Protocol::OpenAi => &OpenAiAdapter,
        Protocol::Anthropic => &AnthropicAdapter,
    }
}

// ---------------------------------------------------------------------------
// OpenAI chat/completions
// ---------------------------------------------------------------------------

pub struct OpenAiAdapter;

impl ProtocolAdapter for OpenAiAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::OpenAi
    }

    fn endpoint_candidates(&self, target: &ModelTarget) -> Vec<String> {
        openai_candidates(&target.api_url)
    }

    fn request_body(
        &self,
        target: &ModelTarget,
        params: &GenerationParams,
        messages: &[ChatMessage],
    ) -> Result<serde_json::Value> {
        let req = ChatCompletionRequest {
            model: &target.model,
            messages,
            temperature: params.temperature.or(target.temperature),
            max_tokens: params.max_tokens.or(target.max_tokens),
            stream: true,
            tools: (!params.tools.is_empty()).then_some(params.tools.as_slice()),
            stream_options: StreamOptions {
                include_usage: true,
            },
        };
        Ok(serde_json::to_value(req)?)
    }

    fn apply_headers(&self, builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiDecoder::new())
    }

    fn decode_complete(&self, value: serde_json::Value) -> Result<Option<StreamChunk>> {
        openai_complete(value)
    }
}

/// `.../chat/completions` as-is, `.../v1` gets the suffix, anything else
/// tries `/v1/chat/completions` then `/chat/completions`.
pub fn openai_candidates(base_url: &str) -> Vec<String> {
    let base = base_url.trim_end_matches('/');
    if base.ends_with(OPENAI_SUFFIX) {
        vec![base.to_string()]
    } else if base.ends_with("/v1") {
        vec![format!("{base}{OPENAI_SUFFIX}")]
    } else {
        vec![
            format!("{base}/v1{OPENAI_SUFFIX}"),
            format!("{base}{OPENAI_SUFFIX}"),
        ]
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages
// ---------------------------------------------------------------------------

pub struct AnthropicAdapter;

impl ProtocolAdapter for AnthropicAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Anthropic
    }

    fn endpoint_candidates(&self, target: &ModelTarget) -> Vec<String> {
        anthropic_candidates(
            &target.api_url,
            target.anthropic_api_path.as_deref(),
            target.bare_base_fallback,
        )
    }

    fn request_body(
        &self,
        target: &ModelTarget,
        params: &GenerationParams,
        messages: &[ChatMessage],
    ) -> Result<serde_json::Value> {
        let conversation = to_anthropic(messages);
        let req = MessagesRequest {
            model: &target.model,
            system: conversation.system,
            messages: conversation.messages,
            max_tokens: params
                .max_tokens
                .or(target.max_tokens)
                .unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS),
            temperature: params.temperature.or(target.temperature),
            stream: true,
            tools: (!params.tools.is_empty()).then(|| to_anthropic_tools(&params.tools)),
        };
        Ok(serde_json::to_value(req)?)
    }

    fn apply_headers(&self, builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicDecoder::new())
    }

    fn decode_complete(&self, value: serde_json::Value) -> Result<Option<StreamChunk>> {
        anthropic_complete(value)
    }
}

/// Like [`openai_candidates`] with `/messages`. An explicit path override
/// is the only candidate. With `bare_base_fallback` the unmodified base URL
/// is tried last, for proxies that expect it as the endpoint.
pub fn anthropic_candidates(
    base_url: &str,
    path_override: Option<&str>,
    bare_base_fallback: bool,
) -> Vec<String> {
    let base = base_url.trim_end_matches('/');

    if let Some(path) = path_override.map(str::trim).filter(|p| !p.is_empty()) {
        return vec![format!("{base}/{}", path.trim_start_matches('/'))];
    }

    if base.ends_with(ANTHROPIC_SUFFIX) {
        vec![base.to_string()]
    } else if base.ends_with("/v1") {
        vec![format!("{base}{ANTHROPIC_SUFFIX}")]
    } else {
        let mut candidates = vec![
            format!("{base}/v1{ANTHROPIC_SUFFIX}"),
            format!("{base}{ANTHROPIC_SUFFIX}"),
        ];
        if bare_base_fallback {
            candidates.push(base.to_string());
        }
        candidates
    }
}
