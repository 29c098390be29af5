use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::errors::{LlmError, ProviderError};
use crate::models::content::{Content, ImageContent, ImageDetail};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::{ToolCall, ToolSchema};

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = Map::new();
        converted.insert("role".to_string(), json!(message.role));

        let has_images = message.content.iter().any(|c| c.as_image().is_some());
        if has_images {
            let parts: Vec<Value> = message
                .content
                .iter()
                .map(|content| match content {
                    Content::Text(text) => json!({"type": "text", "text": text.text}),
                    Content::Image(image) => convert_image(image),
                })
                .collect();
            converted.insert("content".to_string(), Value::Array(parts));
        } else {
            let text = message.text();
            if !text.is_empty() || message.role == Role::Tool {
                converted.insert("content".to_string(), json!(text));
            }
        }

        if !message.tool_calls.is_empty() {
            let tool_calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": sanitize_function_name(&call.name),
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect();
            converted.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }

        if let Some(id) = &message.tool_call_id {
            converted.insert("tool_call_id".to_string(), json!(id));
        }
        if let Some(name) = &message.name {
            converted.insert("name".to_string(), json!(sanitize_function_name(name)));
        }

        if converted.contains_key("content") || converted.contains_key("tool_calls") {
            messages_spec.push(Value::Object(converted));
        }
    }

    messages_spec
}

/// Convert an image content into an OpenAI `image_url` part
pub fn convert_image(image: &ImageContent) -> Value {
    let mut image_url = json!({ "url": image.url });
    match image.detail {
        ImageDetail::Low => image_url["detail"] = json!("low"),
        ImageDetail::High => image_url["detail"] = json!("high"),
        ImageDetail::Auto => image_url["detail"] = json!("auto"),
        ImageDetail::Medium | ImageDetail::Unknown => {}
    }
    json!({
        "type": "image_url",
        "image_url": image_url,
    })
}

/// Convert internal tool schemas to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[ToolSchema]) -> Result<Vec<Value>, LlmError> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(LlmError::Validation(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }
        if !is_valid_function_name(&tool.name) {
            return Err(LlmError::Validation(format!(
                "Invalid tool name '{}', it must match [a-zA-Z0-9_-]+",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Convert OpenAI's API response to internal Message format
///
/// Returns None when the response has no choices.
pub fn openai_response_to_message(response: &Value) -> Option<Message> {
    let original = response.get("choices")?.as_array()?.first()?.get("message")?;
    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(|t| t.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|t| t.as_array()) {
        for tool_call in tool_calls {
            // some compatible servers omit ids, which tool results must reference
            let id = match tool_call["id"].as_str() {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => format!("call_{}", Uuid::new_v4().simple()),
            };
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();

            // Unparseable arguments are kept as a string so the dispatcher can report them
            let arguments = if arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str::<Value>(arguments)
                    .unwrap_or_else(|_| Value::String(arguments.to_string()))
            };

            message = message.with_tool_call(ToolCall::new(id, function_name, arguments));
        }
    }

    Some(message)
}

fn invalid_name_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").ok()).as_ref()
}

pub fn sanitize_function_name(name: &str) -> String {
    match invalid_name_chars() {
        Some(re) => re.replace_all(name, "_").to_string(),
        None => name.to_string(),
    }
}

pub fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty() && invalid_name_chars().is_none_or(|re| !re.is_match(name))
}

pub fn check_openai_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}
