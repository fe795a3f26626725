//! Decode complete (non-streaming) responses.
//!
//! Some servers ignore `stream: true` and answer with one JSON document.
//! Those collapse into at most one chunk, with the same precedence as the
//! streaming decoders: tool calls, then reasoning, then content.

use super::anthropic_types::{MessagesResponse, ResponseBlock};
use super::openai_types::ToolCall;
use super::streaming::{error_message, OpenAiDecoder, StreamChunk};
use crate::error::{BridgeError, Result};

pub fn openai_complete(value: serde_json::Value) -> Result<Option<StreamChunk>> {
    Ok(OpenAiDecoder::new().decode_value(value)?.into_iter().next())
}

pub fn anthropic_complete(value: serde_json::Value) -> Result<Option<StreamChunk>> {
    if let Some(message) = error_message(&value) {
        return Err(BridgeError::upstream(message));
    }

    let resp: MessagesResponse = serde_json::from_value(value)
        .map_err(|e| BridgeError::protocol(format!("Unexpected response shape: {e}")))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(&t),
            ResponseBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::new(id, name, serde_json::to_string(&input)?));
            }
            ResponseBlock::Other => {}
        }
    }

    let chunk = if !tool_calls.is_empty() {
        Some(StreamChunk::ToolCalls { tool_calls })
    } else if !reasoning.is_empty() {
        Some(StreamChunk::reasoning(reasoning))
    } else if !text.is_empty() {
        Some(StreamChunk::content(text))
    } else {
        None
    };
    Ok(chunk)
}
