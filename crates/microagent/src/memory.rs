use std::collections::HashSet;

use crate::errors::MemoryError;
use crate::models::message::Message;
use crate::models::role::Role;

/// Ordered conversation history owned by one agent
///
/// Memory is append-only apart from the tool-availability banner, which lives in the first
/// system message and is rewritten whenever the set of tools changes.
#[derive(Debug, Default, Clone)]
pub struct Memory {
    messages: Vec<Message>,
    emitted_call_ids: HashSet<String>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, rejecting tool results for calls that were never emitted
    pub fn push(&mut self, message: Message) -> Result<(), MemoryError> {
        if message.role == Role::Tool {
            let id = message
                .tool_call_id
                .as_deref()
                .ok_or(MemoryError::MissingToolCallId)?;
            if !self.emitted_call_ids.contains(id) {
                return Err(MemoryError::UnknownToolCallId(id.to_string()));
            }
        }
        if message.role == Role::Assistant {
            self.emitted_call_ids
                .extend(message.tool_calls.iter().map(|call| call.id.clone()));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Replace the text of the first system message, or insert one at the front
    pub fn update_system_banner<S: Into<String>>(&mut self, banner: S) {
        let banner = Message::system().with_text(banner);
        match self.messages.iter_mut().find(|m| m.role == Role::System) {
            Some(existing) => existing.content = banner.content,
            None => self.messages.insert(0, banner),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The most recent `n` assistant messages, oldest first
    pub fn recent_assistant(&self, n: usize) -> Vec<&Message> {
        let mut recent: Vec<&Message> = self
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .take(n)
            .collect();
        recent.reverse();
        recent
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.emitted_call_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use serde_json::json;

    #[test]
    fn test_rejects_unknown_tool_call_id() {
        let mut memory = Memory::new();
        let result = memory.push(Message::tool("call_9", "echo").with_text("hi"));
        assert_eq!(
            result,
            Err(MemoryError::UnknownToolCallId("call_9".to_string()))
        );
        assert!(memory.is_empty());
    }

    #[test]
    fn test_accepts_tool_result_after_call() -> Result<(), MemoryError> {
        let mut memory = Memory::new();
        memory.push(
            Message::assistant().with_tool_call(ToolCall::new("call_1", "echo", json!({}))),
        )?;
        memory.push(Message::tool("call_1", "echo").with_text("hi"))?;
        assert_eq!(memory.len(), 2);
        Ok(())
    }

    #[test]
    fn test_update_system_banner() -> Result<(), MemoryError> {
        let mut memory = Memory::new();
        memory.push(Message::user().with_text("hello"))?;
        memory.update_system_banner("tools: a");
        assert_eq!(memory.messages()[0].role, Role::System);
        assert_eq!(memory.messages()[0].text(), "tools: a");

        memory.update_system_banner("tools: a, b");
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.messages()[0].text(), "tools: a, b");
        Ok(())
    }

    #[test]
    fn test_recent_assistant() -> Result<(), MemoryError> {
        let mut memory = Memory::new();
        memory.push(Message::assistant().with_text("one"))?;
        memory.push(Message::user().with_text("u"))?;
        memory.push(Message::assistant().with_text("two"))?;
        memory.push(Message::assistant().with_text("three"))?;

        let recent = memory.recent_assistant(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text(), "two");
        assert_eq!(recent[1].text(), "three");
        Ok(())
    }
}
