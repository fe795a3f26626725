//! Merge streamed tool-call fragments into complete calls.

use super::openai_types::ToolCall;

/// Merge `incoming` fragments into `existing`, keyed by id.
///
/// Arguments of a known id are appended in arrival order; the name is only
/// filled in while it is still empty. Unknown ids append a new entry, and a
/// fragment without an id gets a synthesized one. Entries are never removed
/// or reordered.
pub fn merge_tool_calls(mut existing: Vec<ToolCall>, incoming: &[ToolCall]) -> Vec<ToolCall> {
    for fragment in incoming {
        let slot = if fragment.id.is_empty() {
            None
        } else {
            existing.iter_mut().find(|c| c.id == fragment.id)
        };

        match slot {
            Some(call) => {
                call.function.arguments.push_str(&fragment.function.arguments);
                if call.function.name.is_empty() && !fragment.function.name.is_empty() {
                    call.function.name = fragment.function.name.clone();
                }
            }
            None => {
                let mut call = fragment.clone();
                if call.id.is_empty() {
                    call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                }
                existing.push(call);
            }
        }
    }
    existing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_concatenate_in_order() {
        let mut calls = Vec::new();
        for frag in ["{\"ci", "ty\":", "\"Paris\"}"] {
            calls = merge_tool_calls(calls, &[ToolCall::new("c1", "", frag)]);
        }
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.arguments, r#"{"city":"Paris"}"#);
        assert!(serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).is_ok());
    }

    #[test]
    fn test_first_non_empty_name_wins() {
        let calls = merge_tool_calls(
            Vec::new(),
            &[
                ToolCall::new("c1", "", ""),
                ToolCall::new("c1", "get_weather", "{"),
                ToolCall::new("c1", "other", "}"),
            ],
        );
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{}");
    }

    #[test]
    fn test_distinct_ids_keep_order() {
        let calls = merge_tool_calls(
            Vec::new(),
            &[
                ToolCall::new("b", "second", "{}"),
                ToolCall::new("a", "first", "{}"),
            ],
        );
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let calls = merge_tool_calls(
            Vec::new(),
            &[ToolCall::new("", "f", "{}"), ToolCall::new("", "g", "{}")],
        );
        assert_eq!(calls.len(), 2);
        assert!(calls[0].id.starts_with("call_"));
        assert_ne!(calls[0].id, calls[1].id);
    }
}
