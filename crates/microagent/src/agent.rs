use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{AgentError, AgentResult, FederationError, LlmError};
use crate::federation::ToolFederation;
use crate::memory::Memory;
use crate::model_client::ModelClient;
use crate::models::message::Message;
use crate::models::tool::ToolCall;
use crate::prompt_template::{
    builtin_prompt, MULTIMEDIA_PROMPT, NEXT_STEP_PROMPT, STUCK_PROMPT, SYSTEM_PROMPT,
};
use crate::providers::base::ToolChoice;
use crate::record::{RecordSink, StepRecord, ToolCallResult, Transcript};
use crate::tool::ToolOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Running,
    Finished,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Finished => "finished",
            AgentState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Leading system prompt; the built-in prompt is used when unset
    pub system_prompt: Option<String>,
    /// Sent as a user message before every decision; the built-in prompt is used when unset
    /// and an empty string sends nothing
    pub next_step_prompt: Option<String>,
    pub max_steps: u32,
    /// Re-list the tool servers every this many steps; 0 disables refreshing
    pub refresh_interval: u32,
    /// Tools that end the run, matched on the server's own tool name, ignoring case
    pub terminal_tools: Vec<String>,
    /// Identical assistant turns in a row that count as being stuck
    pub stuck_threshold: usize,
    pub tool_choice: ToolChoice,
    pub stop_on_token_limit: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "microagent".to_string(),
            system_prompt: None,
            next_step_prompt: None,
            max_steps: 40,
            refresh_interval: 5,
            terminal_tools: vec!["terminate".to_string()],
            stuck_threshold: 3,
            tool_choice: ToolChoice::Auto,
            stop_on_token_limit: true,
        }
    }
}

/// The think/act loop driving a model against a federation of tool servers
pub struct Agent {
    config: AgentConfig,
    client: Arc<ModelClient>,
    federation: Arc<ToolFederation>,
    sink: Option<Arc<dyn RecordSink>>,
    memory: Memory,
    state: AgentState,
    current_step: u32,
    /// Set once the current stuck episode has been nudged
    stuck_nudged: bool,
}

impl Agent {
    pub fn new(config: AgentConfig, client: Arc<ModelClient>, federation: Arc<ToolFederation>) -> Self {
        Self {
            config,
            client,
            federation,
            sink: None,
            memory: Memory::new(),
            state: AgentState::Idle,
            current_step: 0,
            stuck_nudged: false,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn federation(&self) -> &Arc<ToolFederation> {
        &self.federation
    }

    /// Return to `Idle` with an empty conversation
    pub fn reset(&mut self) {
        self.memory.clear();
        self.state = AgentState::Idle;
        self.current_step = 0;
        self.stuck_nudged = false;
    }

    fn system_prompt(&self) -> AgentResult<String> {
        match &self.config.system_prompt {
            Some(prompt) => Ok(prompt.clone()),
            None => builtin_prompt(SYSTEM_PROMPT, &HashMap::<String, String>::new())
                .map_err(|e| AgentError::Prompt(e.to_string())),
        }
    }

    fn next_step_prompt(&self) -> AgentResult<Option<String>> {
        match self.config.next_step_prompt.as_deref() {
            Some("") => Ok(None),
            Some(prompt) => Ok(Some(prompt.to_string())),
            None => builtin_prompt(NEXT_STEP_PROMPT, &HashMap::<String, String>::new())
                .map(Some)
                .map_err(|e| AgentError::Prompt(e.to_string())),
        }
    }

    async fn banner(&self) -> AgentResult<String> {
        let tools = self.federation.tool_names().await;
        Ok(format!(
            "{}\n\nAvailable MCP tools: {}",
            self.system_prompt()?,
            tools.join(", ")
        ))
    }

    /// Write the system prompt and the tool-availability banner
    pub async fn initialize(&mut self) -> AgentResult<()> {
        let banner = self.banner().await?;
        self.memory.update_system_banner(banner);
        Ok(())
    }

    async fn refresh_tools(&mut self) -> AgentResult<()> {
        let report = self.federation.refresh().await;
        if !report.added.is_empty() {
            self.memory.push(
                Message::system().with_text(format!("New tools available: {}", report.added.join(", "))),
            )?;
        }
        if !report.removed.is_empty() {
            self.memory.push(Message::system().with_text(format!(
                "Tools no longer available: {}",
                report.removed.join(", ")
            )))?;
        }
        if !report.added.is_empty() || !report.removed.is_empty() {
            let banner = self.banner().await?;
            self.memory.update_system_banner(banner);
        }
        Ok(())
    }

    /// Match the tool's un-namespaced name, or the bare name when it is not registered
    async fn is_terminal(&self, name: &str) -> bool {
        let original = match self.federation.resolve(name).await {
            Some((_, original)) => original,
            None => name.to_string(),
        };
        self.config
            .terminal_tools
            .iter()
            .any(|terminal| terminal.eq_ignore_ascii_case(&original))
    }

    async fn finish_if_no_tools(&mut self) -> bool {
        if self.federation.tool_count().await == 0 {
            info!(agent = %self.config.name, "no tools available, finishing");
            self.state = AgentState::Finished;
            return true;
        }
        false
    }

    async fn execute_tool(&self, call: &ToolCall) -> ToolOutput {
        if let Value::String(raw) = &call.arguments {
            return ToolOutput::error(format!(
                "Invalid arguments for {}: not a JSON object: {}",
                call.name, raw
            ));
        }
        match self.federation.call(&call.name, call.arguments.clone()).await {
            Ok(output) => output,
            Err(FederationError::UnknownTool(_)) => ToolOutput::error("Unknown tool"),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool call failed");
                ToolOutput::error(e.to_string())
            }
        }
    }

    /// Run one think/act cycle
    pub async fn step(&mut self) -> AgentResult<StepRecord> {
        self.current_step += 1;
        let step = self.current_step;
        let mut record = StepRecord::new(step);

        if self.finish_if_no_tools().await {
            return Ok(record);
        }
        if self.config.refresh_interval > 0 && step % self.config.refresh_interval == 0 {
            self.refresh_tools().await?;
            if self.finish_if_no_tools().await {
                return Ok(record);
            }
        }

        if let Some(prompt) = self.next_step_prompt()? {
            self.memory.push(Message::user().with_text(prompt))?;
        }

        let tools = self.federation.tool_schemas().await;
        let decision = match self
            .client
            .decide(self.memory.messages(), &[], &tools, self.config.tool_choice)
            .await
        {
            Ok(decision) => decision,
            Err(e @ LlmError::TokenLimitExceeded { .. }) => {
                warn!(step, error = %e, "token limit reached");
                self.memory.push(Message::assistant().with_text(format!(
                    "Maximum token limit reached, cannot continue execution: {}",
                    e
                )))?;
                record.error = Some(e.to_string());
                if self.config.stop_on_token_limit {
                    self.state = AgentState::Finished;
                }
                return Ok(record);
            }
            Err(e) => {
                warn!(step, error = %e, "model decision failed");
                record.error = Some(e.to_string());
                return Ok(record);
            }
        };
        record.token_usage = Some(decision.usage);

        let Some(turn) = decision.turn else {
            debug!(step, "model returned no turn");
            return Ok(record);
        };
        let thought = turn.text();
        if !thought.is_empty() {
            record.thought = Some(thought);
        }
        record.tool_calls = turn.tool_calls.clone();
        info!(
            step,
            tool_calls = turn.tool_calls.len(),
            thought = record.thought.as_deref().unwrap_or_default(),
            "agent decided"
        );
        self.memory.push(turn.clone())?;

        for call in &turn.tool_calls {
            let output = self.execute_tool(call).await;
            let rendered = if output.is_error() {
                output.to_string()
            } else {
                format!("Observed output of cmd `{}` executed:\n{}", call.name, output)
            };
            info!(step, tool = %call.name, is_error = output.is_error(), "tool executed");

            let mut message = Message::tool(call.id.clone(), call.name.clone()).with_text(rendered.clone());
            if let Some(image) = &output.base64_image {
                message = message.with_base64_image(image.clone());
            }
            self.memory.push(message)?;
            record.tool_results.push(ToolCallResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                output: rendered,
                is_error: output.is_error(),
            });

            if output.base64_image.is_some() {
                let hint = builtin_prompt(MULTIMEDIA_PROMPT, &json!({ "tool_name": call.name }))
                    .map_err(|e| AgentError::Prompt(e.to_string()))?;
                self.memory.push(Message::system().with_text(hint))?;
            }

            if self.is_terminal(&call.name).await {
                info!(step, tool = %call.name, "terminal tool called, finishing");
                self.state = AgentState::Finished;
                break;
            }
        }

        Ok(record)
    }

    /// Whether the last turns repeat the same text without calling tools
    fn is_stuck(&self) -> bool {
        let threshold = self.config.stuck_threshold;
        if threshold == 0 {
            return false;
        }
        let recent = self.memory.recent_assistant(threshold);
        let Some(first) = recent.first() else {
            return false;
        };
        recent.len() == threshold
            && !first.has_tool_calls()
            && !first.text().trim().is_empty()
            && recent.iter().all(|m| m.same_turn(first))
    }

    fn handle_stuck(&mut self) -> AgentResult<()> {
        if !self.is_stuck() {
            self.stuck_nudged = false;
            return Ok(());
        }
        if self.stuck_nudged {
            return Ok(());
        }
        warn!(agent = %self.config.name, step = self.current_step, "agent is repeating itself");
        let nudge = builtin_prompt(STUCK_PROMPT, &HashMap::<String, String>::new())
            .map_err(|e| AgentError::Prompt(e.to_string()))?;
        self.memory.push(Message::system().with_text(nudge))?;
        self.stuck_nudged = true;
        Ok(())
    }

    async fn run_loop(&mut self, prompt: Option<&str>, transcript: &mut Transcript) -> AgentResult<()> {
        self.state = AgentState::Running;
        self.initialize().await?;
        if let Some(prompt) = prompt {
            self.memory.push(Message::user().with_text(prompt))?;
        }

        while self.state == AgentState::Running && self.current_step < self.config.max_steps {
            match self.step().await {
                Ok(record) => transcript.steps.push(record),
                Err(e) => {
                    let mut record = StepRecord::new(self.current_step);
                    record.error = Some(e.to_string());
                    transcript.steps.push(record);
                    return Err(e);
                }
            }
            self.handle_stuck()?;
        }

        if self.state == AgentState::Running {
            info!(agent = %self.config.name, max_steps = self.config.max_steps, "step limit reached");
            self.state = AgentState::Finished;
        }
        Ok(())
    }

    async fn cleanup(&self) {
        self.federation.disconnect_all().await;
        debug!(agent = %self.config.name, "tool servers scheduled for disconnect");
    }

    /// Run the loop until a terminal tool, the step limit or an error
    ///
    /// Tool servers are disconnected when the run ends, whatever the outcome.
    pub async fn run(&mut self, prompt: Option<&str>) -> AgentResult<Transcript> {
        if self.state != AgentState::Idle {
            return Err(AgentError::InvalidState(self.state.to_string()));
        }

        let mut transcript = Transcript::new(self.config.name.clone(), prompt.map(str::to_string));
        let result = self.run_loop(prompt, &mut transcript).await;
        if result.is_err() {
            self.state = AgentState::Error;
        }
        self.cleanup().await;

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.write(&transcript).await {
                warn!(error = %e, "failed to write transcript");
            }
        }
        result.map(|_| transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_client::ModelClientConfig;
    use crate::providers::mock::MockProvider;
    use crate::retry::RetryPolicy;
    use crate::session::local::LocalTransport;
    use crate::session::TransportKind;
    use crate::tool::Terminate;

    async fn agent_with(responses: Vec<Message>, config: AgentConfig) -> Agent {
        let provider = Arc::new(MockProvider::new(responses));
        let client = ModelClient::new(provider, ModelClientConfig::new("gpt-4o"))
            .with_retry_policy(RetryPolicy::none());
        let federation = Arc::new(ToolFederation::new());
        federation
            .attach(
                None,
                TransportKind::Local,
                Box::new(LocalTransport::new(vec![Arc::new(Terminate)])),
            )
            .await
            .unwrap();
        Agent::new(config, Arc::new(client), federation)
    }

    #[test]
    fn test_terminal_tool_names() {
        tokio_test::block_on(async {
            let agent = agent_with(vec![], AgentConfig::default()).await;
            assert!(agent.is_terminal("local_0_terminate").await);
            assert!(agent.is_terminal("Terminate").await);
            assert!(!agent.is_terminal("terminate_all").await);
            assert!(!agent.is_terminal("process_terminate").await);
            assert!(!agent.is_terminal("stdio_0_process_terminate").await);
        });
    }

    #[tokio::test]
    async fn test_model_error_is_step_data() -> AgentResult<()> {
        let provider = Arc::new(MockProvider::with_results(vec![
            Err(crate::errors::ProviderError::BadRequest {
                status: 400,
                message: "bad".into(),
            }),
            Ok(Message::assistant().with_tool_call(ToolCall::new(
                "call_1",
                "local_0_terminate",
                json!({"status": "success"}),
            ))),
        ]));
        let client = ModelClient::new(provider, ModelClientConfig::new("gpt-4o"))
            .with_retry_policy(RetryPolicy::none());
        let federation = Arc::new(ToolFederation::new());
        federation
            .attach(
                None,
                TransportKind::Local,
                Box::new(LocalTransport::new(vec![Arc::new(Terminate)])),
            )
            .await?;

        let mut agent = Agent::new(AgentConfig::default(), Arc::new(client), federation);
        let transcript = agent.run(Some("go")).await?;
        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(transcript.len(), 2);
        assert!(transcript.steps[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("400")));
        assert!(transcript.steps[1].error.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_next_step_prompt_defaults_and_disables() -> AgentResult<()> {
        let builtin = builtin_prompt(NEXT_STEP_PROMPT, &HashMap::<String, String>::new())
            .map_err(|e| AgentError::Prompt(e.to_string()))?;

        let mut agent = agent_with(vec![], AgentConfig::default()).await;
        agent.step().await?;
        let users: Vec<String> = agent
            .memory()
            .messages()
            .iter()
            .filter(|m| m.role == crate::models::role::Role::User)
            .map(|m| m.text())
            .collect();
        assert_eq!(users, vec![builtin]);

        let config = AgentConfig {
            next_step_prompt: Some(String::new()),
            ..Default::default()
        };
        let mut agent = agent_with(vec![], config).await;
        agent.step().await?;
        assert!(agent.memory().messages().iter().all(|m| m.role != crate::models::role::Role::User));
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_writes_banner() -> AgentResult<()> {
        let config = AgentConfig {
            system_prompt: Some("You are helpful.".into()),
            ..Default::default()
        };
        let mut agent = agent_with(vec![], config).await;
        agent.initialize().await?;
        assert_eq!(
            agent.memory().messages()[0].text(),
            "You are helpful.\n\nAvailable MCP tools: local_0_terminate"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_run_until_terminate() -> AgentResult<()> {
        let responses = vec![Message::assistant().with_tool_call(ToolCall::new(
            "call_1",
            "local_0_terminate",
            json!({"status": "success"}),
        ))];
        let mut agent = agent_with(responses, AgentConfig::default()).await;

        let transcript = agent.run(Some("stop now")).await?;
        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(transcript.len(), 1);
        assert_eq!(
            transcript.steps[0].tool_results[0].output,
            "Observed output of cmd `local_0_terminate` executed:\nThe interaction has been completed with status: success"
        );
        // cleanup disconnected the servers
        assert!(agent.federation().is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_rejects_non_idle_state() -> AgentResult<()> {
        let responses = vec![Message::assistant().with_tool_call(ToolCall::new(
            "call_1",
            "terminate",
            json!({"status": "success"}),
        ))];
        let mut agent = agent_with(responses, AgentConfig::default()).await;
        agent.run(None).await?;
        let second = agent.run(None).await;
        assert!(matches!(second, Err(AgentError::InvalidState(_))));

        agent.reset();
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.memory().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_step_limit_finishes() -> AgentResult<()> {
        let responses = vec![
            Message::assistant().with_text("thinking"),
            Message::assistant().with_text("still thinking"),
        ];
        let config = AgentConfig {
            max_steps: 2,
            ..Default::default()
        };
        let mut agent = agent_with(responses, config).await;
        let transcript = agent.run(Some("go")).await?;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.steps[1].thought.as_deref(), Some("still thinking"));
        assert_eq!(agent.state(), AgentState::Finished);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported() -> AgentResult<()> {
        let responses = vec![Message::assistant().with_tool_call(ToolCall::new(
            "call_1",
            "local_0_missing",
            json!({}),
        ))];
        let config = AgentConfig {
            max_steps: 1,
            ..Default::default()
        };
        let mut agent = agent_with(responses, config).await;
        let transcript = agent.run(Some("go")).await?;
        let result = &transcript.steps[0].tool_results[0];
        assert_eq!(result.output, "Error: Unknown tool");
        assert!(result.is_error);
        Ok(())
    }

    #[tokio::test]
    async fn test_token_limit_finishes_run() -> AgentResult<()> {
        let provider = Arc::new(MockProvider::new(vec![]));
        let mut config = ModelClientConfig::new("gpt-4o");
        config.max_input_tokens = Some(10);
        let client = ModelClient::new(provider, config).with_retry_policy(RetryPolicy::none());
        let federation = Arc::new(ToolFederation::new());
        federation
            .attach(
                None,
                TransportKind::Local,
                Box::new(LocalTransport::new(vec![Arc::new(Terminate)])),
            )
            .await?;

        let mut agent = Agent::new(AgentConfig::default(), Arc::new(client), federation);
        let transcript = agent.run(Some("a long enough request to blow the budget")).await?;
        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(transcript.len(), 1);
        assert!(transcript.steps[0].error.is_some());

        let last = agent.memory().messages().last().unwrap();
        assert!(last
            .text()
            .starts_with("Maximum token limit reached, cannot continue execution:"));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_tools_finishes() -> AgentResult<()> {
        let provider = Arc::new(MockProvider::new(vec![]));
        let client = ModelClient::new(provider, ModelClientConfig::new("gpt-4o"));
        let mut agent = Agent::new(
            AgentConfig::default(),
            Arc::new(client),
            Arc::new(ToolFederation::new()),
        );
        let transcript = agent.run(Some("hello")).await?;
        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(transcript.len(), 1);
        assert!(transcript.steps[0].token_usage.is_none());
        Ok(())
    }
}
