use super::content::Content;
use super::role::Role;
use super::tool::ToolCall;
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub created: i64,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inline jpeg attachment, only forwarded to multimodal models
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_image: Option<String>,
}

impl Message {
    fn new(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            base64_image: None,
        }
    }

    /// Create a new user message with the current timestamp
    pub fn user() -> Self {
        Self::new(Role::User)
    }

    /// Create a new assistant message with the current timestamp
    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    pub fn system() -> Self {
        Self::new(Role::System)
    }

    /// Create a tool result message answering the call with `tool_call_id`
    pub fn tool<I: Into<String>, N: Into<String>>(tool_call_id: I, name: N) -> Self {
        let mut message = Self::new(Role::Tool);
        message.tool_call_id = Some(tool_call_id.into());
        message.name = Some(name.into());
        message
    }

    /// Add any Content to the message
    pub fn with_content(mut self, content: Content) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(Content::text(text))
    }

    /// Add image content to the message
    pub fn with_image<S: Into<String>>(self, url: S) -> Self {
        self.with_content(Content::image(url))
    }

    /// Add a tool call to the message
    pub fn with_tool_call(mut self, tool_call: ToolCall) -> Self {
        self.tool_calls.push(tool_call);
        self
    }

    pub fn with_base64_image<S: Into<String>>(mut self, data: S) -> Self {
        self.base64_image = Some(data.into());
        self
    }

    /// All text parts joined with newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Whether the message carries anything worth sending to a model
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
            && self.content.iter().all(|c| match c {
                Content::Text(text) => text.text.is_empty(),
                Content::Image(_) => false,
            })
    }

    /// Compare two turns ignoring their timestamps
    pub fn same_turn(&self, other: &Message) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.tool_calls == other.tool_calls
    }
}
