//! Decoders turning provider SSE payloads into [`StreamChunk`]s.
//!
//! Both grammars arrive as `data:` lines. [`SseLines`] does the framing;
//! an [`OpenAiDecoder`] or [`AnthropicDecoder`] turns each payload into zero
//! or more chunks. A decoder lives for exactly one stream attempt and owns
//! the state that correlates later fragments with earlier ones (tool-call
//! indices for OpenAI, content-block indices for Anthropic).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::anthropic_types::{Delta, StreamEvent};
use super::openai_types::{ChatCompletionChunk, ChunkChoice, ToolCall};
use super::repair::repair_doubled_chars;
use crate::error::{BridgeError, Result};

/// One normalized unit of a model response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Content { content: String },
    Reasoning { reasoning: String },
    /// Tool-call fragments; merge with [`super::accumulator::merge_tool_calls`].
    ToolCalls { tool_calls: Vec<ToolCall> },
    /// Terminal summary. Emitted by the retry wrapper, never by a decoder.
    Done { result: StreamOutcome },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            content: text.into(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning {
            reasoning: text.into(),
        }
    }
}

/// What a single SSE payload decoded into.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Chunks(Vec<StreamChunk>),
    /// `[DONE]` or `message_stop`: the stream is over.
    End,
}

pub trait StreamDecoder: Send {
    /// Decode the payload of one `data:` line.
    ///
    /// `BridgeError::Protocol` means the line was unreadable and may be
    /// skipped; `BridgeError::Upstream` means the server reported an error
    /// and the stream must stop.
    fn decode(&mut self, data: &str) -> Result<Decoded>;
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Byte buffer that yields the payload of complete `data:` lines.
///
/// Splitting happens on raw bytes so a multi-byte character cut between two
/// network reads is reassembled before UTF-8 decoding.
#[derive(Debug, Default)]
pub struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete `data:` payload, skipping `event:` lines, comments and blanks.
    pub fn next_data(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = data_payload(&line[..line.len() - 1]) {
                return Some(data);
            }
        }
        None
    }

    /// Payload of a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let data = line.strip_prefix(b"data:")?;
    let text = String::from_utf8_lossy(data);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn parse_json(data: &str) -> Result<serde_json::Value> {
    serde_json::from_str(data).map_err(|e| BridgeError::protocol(format!("Unparseable SSE payload: {e}")))
}

/// `error.message` of an error envelope, if the payload is one.
pub(crate) fn error_message(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    match error {
        serde_json::Value::String(s) => Some(s.clone()),
        _ => error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// OpenAI chat.completion.chunk
// ---------------------------------------------------------------------------

/// Decoder for OpenAI-compatible `chat.completion.chunk` payloads.
#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    /// Tool-call index -> id, recorded from the fragment that carried the id.
    tool_ids: HashMap<usize, String>,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an already-parsed chunk or complete response.
    pub fn decode_value(&mut self, value: serde_json::Value) -> Result<Vec<StreamChunk>> {
        if let Some(message) = error_message(&value) {
            return Err(BridgeError::upstream(message));
        }

        let chunk: ChatCompletionChunk = serde_json::from_value(value)
            .map_err(|e| BridgeError::protocol(format!("Unexpected chunk shape: {e}")))?;

        Ok(chunk
            .choices
            .first()
            .map(|choice| self.decode_choice(choice))
            .unwrap_or_default())
    }

    fn decode_choice(&mut self, choice: &ChunkChoice) -> Vec<StreamChunk> {
        let Some(delta) = choice.delta.as_ref().or(choice.message.as_ref()) else {
            return Vec::new();
        };

        if let Some(calls) = delta.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            let tool_calls = calls
                .iter()
                .enumerate()
                .map(|(position, tc)| {
                    let index = tc.index.unwrap_or(position);
                    let id = match tc.id.as_deref().filter(|id| !id.is_empty()) {
                        Some(id) => {
                            self.tool_ids.insert(index, id.to_string());
                            id.to_string()
                        }
                        None => self
                            .tool_ids
                            .get(&index)
                            .cloned()
                            .unwrap_or_else(|| format!("tool_call_{index}")),
                    };
                    let function = tc.function.clone().unwrap_or_default();
                    ToolCall::new(
                        id,
                        function.name.unwrap_or_default(),
                        function.arguments.unwrap_or_default(),
                    )
                })
                .collect();
            return vec![StreamChunk::ToolCalls { tool_calls }];
        }

        let mut chunks = Vec::new();
        if let Some(reasoning) = delta.reasoning.text().or_else(|| choice.reasoning.text()) {
            chunks.push(StreamChunk::reasoning(repair_doubled_chars(reasoning)));
        }
        if let Some(content) = delta.content_text() {
            chunks.push(StreamChunk::content(content));
        }
        chunks
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode(&mut self, data: &str) -> Result<Decoded> {
        if data == "[DONE]" {
            return Ok(Decoded::End);
        }
        let value = parse_json(data)?;
        self.decode_value(value).map(Decoded::Chunks)
    }
}

// ---------------------------------------------------------------------------
// Anthropic Messages stream events
// ---------------------------------------------------------------------------

/// Decoder for Anthropic Messages streaming events.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    /// Content-block index -> (tool id, tool name), from `content_block_start`.
    tool_blocks: HashMap<usize, (String, String)>,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_event(&mut self, event: StreamEvent) -> Result<Decoded> {
        let chunks = match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } if content_block.block_type == "tool_use" => {
                let id = content_block
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("tool_call_{index}"));
                let name = content_block.name.unwrap_or_default();
                self.tool_blocks.insert(index, (id.clone(), name.clone()));

                let arguments = match content_block.input {
                    Some(ref input) if has_content(input) => serde_json::to_string(input)?,
                    _ => String::new(),
                };
                vec![StreamChunk::ToolCalls {
                    tool_calls: vec![ToolCall::new(id, name, arguments)],
                }]
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } if !text.is_empty() => vec![StreamChunk::content(text)],
                Delta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    vec![StreamChunk::reasoning(thinking)]
                }
                Delta::InputJsonDelta { partial_json } => {
                    let (id, name) = self
                        .tool_blocks
                        .get(&index)
                        .cloned()
                        .unwrap_or_else(|| (format!("tool_call_{index}"), String::new()));
                    vec![StreamChunk::ToolCalls {
                        tool_calls: vec![ToolCall::new(id, name, partial_json)],
                    }]
                }
                _ => Vec::new(),
            },
            StreamEvent::MessageStop => return Ok(Decoded::End),
            StreamEvent::Error { error } => return Err(BridgeError::upstream(error.message)),
            StreamEvent::ContentBlockStart { .. } | StreamEvent::Other => Vec::new(),
        };
        Ok(Decoded::Chunks(chunks))
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, data: &str) -> Result<Decoded> {
        let value = parse_json(data)?;

        if value.get("type").and_then(serde_json::Value::as_str) == Some("error") {
            let message = error_message(&value).unwrap_or_else(|| "Unknown upstream error".to_string());
            return Err(BridgeError::upstream(message));
        }

        let event: StreamEvent = serde_json::from_value(value)
            .map_err(|e| BridgeError::protocol(format!("Unexpected event shape: {e}")))?;
        self.decode_event(event)
    }
}

fn has_content(input: &serde_json::Value) -> bool {
    match input {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
