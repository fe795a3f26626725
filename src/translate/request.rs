//! Translate chat conversations into the Anthropic Messages shape.
//!
//! The OpenAI shape is the native shape of [`ChatMessage`], so only this
//! direction exists. System messages are hoisted into one `system` string,
//! tool results become `user` turns, and consecutive same-role turns are
//! merged because the Messages API rejects them.

use super::anthropic_types::{ContentBlock, Conversation, ImageSource, Message, Role, Tool};
use super::openai_types::{ChatContent, ChatMessage, ChatRole, ChatTool, ContentPart, ToolCall};

const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const URL_PREVIEW_CHARS: usize = 50;

/// Translate a chat message list into `{system, messages}`.
/// Pure function: never fails, unsupported content degrades to text.
pub fn to_anthropic(messages: &[ChatMessage]) -> Conversation {
    let system_parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(ChatMessage::text)
        .filter(|t| !t.is_empty())
        .collect();

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n"))
    };

    let mut out: Vec<Message> = Vec::new();

    for msg in messages {
        let translated = match msg.role {
            ChatRole::System => continue,
            ChatRole::Tool => translate_tool_result(msg),
            ChatRole::User => Message {
                role: Role::User,
                content: non_empty(content_blocks(msg.content.as_ref())),
            },
            ChatRole::Assistant => {
                let mut blocks = content_blocks(msg.content.as_ref());
                if let Some(ref calls) = msg.tool_calls {
                    blocks.extend(calls.iter().map(tool_use_block));
                }
                Message {
                    role: Role::Assistant,
                    content: non_empty(blocks),
                }
            }
        };
        push_merged(&mut out, translated);
    }

    Conversation {
        system,
        messages: out,
    }
}

/// Convert OpenAI-style function tools into Anthropic tool definitions.
pub fn to_anthropic_tools(tools: &[ChatTool]) -> Vec<Tool> {
    tools
        .iter()
        .map(|t| Tool {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            input_schema: t.function.parameters.clone(),
        })
        .collect()
}

fn push_merged(out: &mut Vec<Message>, msg: Message) {
    match out.last_mut() {
        Some(prev) if prev.role == msg.role => prev.content.extend(msg.content),
        _ => out.push(msg),
    }
}

fn translate_tool_result(msg: &ChatMessage) -> Message {
    let text = msg.text();
    let block = match msg.tool_call_id {
        Some(ref id) => ContentBlock::ToolResult {
            tool_use_id: id.clone(),
            content: text,
        },
        None => ContentBlock::Text { text },
    };
    Message {
        role: Role::User,
        content: vec![block],
    }
}

fn content_blocks(content: Option<&ChatContent>) -> Vec<ContentBlock> {
    match content {
        None => Vec::new(),
        Some(ChatContent::Text(t)) if t.is_empty() => Vec::new(),
        Some(ChatContent::Text(t)) => vec![ContentBlock::Text { text: t.clone() }],
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter(|p| !matches!(p, ContentPart::Text { text } if text.is_empty()))
            .map(part_to_block)
            .collect(),
    }
}

fn part_to_block(part: &ContentPart) -> ContentBlock {
    match part {
        ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
        ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
            Some((media_type, data)) if SUPPORTED_IMAGE_TYPES.contains(&media_type) => {
                ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".to_string(),
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    },
                }
            }
            _ => ContentBlock::Text {
                text: format!("[Image omitted: {}]", preview(&image_url.url)),
            },
        },
        ContentPart::VideoUrl { video_url } => ContentBlock::Text {
            text: format!("[Video not supported: {}]", preview(&video_url.url)),
        },
    }
}

fn tool_use_block(call: &ToolCall) -> ContentBlock {
    let input = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
        .ok()
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

    ContentBlock::ToolUse {
        id: call.id.clone(),
        name: call.function.name.clone(),
        input,
    }
}

fn non_empty(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    if blocks.is_empty() {
        vec![ContentBlock::Text {
            text: String::new(),
        }]
    } else {
        blocks
    }
}

/// Split `data:<media>;base64,<payload>` into `(media, payload)`.
pub(crate) fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mut params = header.split(';');
    let media_type = params.next().filter(|m| !m.is_empty())?;
    if !params.any(|p| p == "base64") || data.is_empty() {
        return None;
    }
    Some((media_type, data))
}

pub(crate) fn preview(url: &str) -> String {
    if url.chars().count() <= URL_PREVIEW_CHARS {
        url.to_string()
    } else {
        let head: String = url.chars().take(URL_PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}
