use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::models::tool::ToolCall;
use crate::providers::base::TokenUsage;

/// What one tool call produced, as shown to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub name: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Everything that happened during one step of the loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    /// Assistant text accompanying the decision, if any
    pub thought: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolCallResult>,
    pub token_usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new(step: u32) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }
}

/// The ordered steps produced by one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub agent: String,
    pub prompt: Option<String>,
    pub steps: Vec<StepRecord>,
}

impl Transcript {
    pub fn new<S: Into<String>>(agent: S, prompt: Option<String>) -> Self {
        Self {
            agent: agent.into(),
            prompt,
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of the usage of every step that reported one
    pub fn total_usage(&self) -> TokenUsage {
        self.steps
            .iter()
            .filter_map(|s| s.token_usage.as_ref())
            .fold(TokenUsage::default(), |acc, u| {
                TokenUsage::new(
                    acc.input_tokens + u.input_tokens,
                    acc.output_tokens + u.output_tokens,
                )
            })
    }
}

/// Receives the transcript when a run ends
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, transcript: &Transcript) -> anyhow::Result<()>;
}

/// Keeps transcripts in memory
#[derive(Default)]
pub struct MemorySink {
    transcripts: Mutex<Vec<Transcript>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transcripts(&self) -> Vec<Transcript> {
        self.transcripts.lock().await.clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, transcript: &Transcript) -> anyhow::Result<()> {
        self.transcripts.lock().await.push(transcript.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_total_usage() {
        let mut transcript = Transcript::new("agent", Some("hello".into()));
        let mut first = StepRecord::new(1);
        first.token_usage = Some(TokenUsage::new(100, 20));
        let mut second = StepRecord::new(2);
        second.token_usage = Some(TokenUsage::new(150, 30));
        transcript.steps = vec![first, second, StepRecord::new(3)];

        assert_eq!(transcript.total_usage(), TokenUsage::new(250, 50));
    }

    #[test]
    fn test_step_record_serialization() {
        let mut record = StepRecord::new(1);
        record.tool_calls = vec![ToolCall::new("call_1", "stdio_0_echo", json!({"text": "hi"}))];
        record.tool_results = vec![ToolCallResult {
            tool_call_id: "call_1".into(),
            name: "stdio_0_echo".into(),
            output: "hi".into(),
            is_error: false,
        }];

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["step"], 1);
        assert_eq!(value["tool_calls"][0]["name"], "stdio_0_echo");
        assert_eq!(value["tool_results"][0]["output"], "hi");
        assert!(value["error"].is_null());
    }

    #[tokio::test]
    async fn test_memory_sink() -> anyhow::Result<()> {
        let sink = MemorySink::new();
        sink.write(&Transcript::new("agent", None)).await?;
        assert_eq!(sink.transcripts().await.len(), 1);
        Ok(())
    }
}
