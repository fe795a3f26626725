//! Plain-text re-encoding of a conversation.
//!
//! Used as the fallback message list when a request in the standard encoding
//! fails or comes back empty: no content parts, no tool metadata, nothing
//! an older or stricter endpoint could reject.

use super::openai_types::{ChatContent, ChatMessage, ChatRole, ContentPart};
use super::request::preview;

pub fn simplify_messages(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages.iter().map(simplify).collect()
}

fn simplify(msg: &ChatMessage) -> ChatMessage {
    match msg.role {
        ChatRole::System => ChatMessage::system(flatten(msg.content.as_ref())),
        ChatRole::User => ChatMessage::user(flatten(msg.content.as_ref())),
        ChatRole::Assistant => {
            let mut lines = Vec::new();
            let text = flatten(msg.content.as_ref());
            if !text.is_empty() {
                lines.push(text);
            }
            for call in msg.tool_calls.iter().flatten() {
                lines.push(format!(
                    "[tool call] {}({})",
                    call.function.name, call.function.arguments
                ));
            }
            ChatMessage::assistant(lines.join("\n"))
        }
        ChatRole::Tool => {
            let id = msg.tool_call_id.as_deref().unwrap_or("unknown");
            ChatMessage::user(format!(
                "[tool result {id}]\n{}",
                flatten(msg.content.as_ref())
            ))
        }
    }
}

fn flatten(content: Option<&ChatContent>) -> String {
    match content {
        None => String::new(),
        Some(ChatContent::Text(t)) => t.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:") => {
                    "[image]".to_string()
                }
                ContentPart::ImageUrl { image_url } => format!("[image: {}]", preview(&image_url.url)),
                ContentPart::VideoUrl { video_url } => format!("[video: {}]", preview(&video_url.url)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
