use anyhow::Result;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use microagent::agent::{Agent, AgentConfig};
use microagent::federation::ToolFederation;
use microagent::model_client::ModelClient;
use microagent::record::{RecordSink, StepRecord, Transcript};
use microagent::session::local::LocalTransport;
use microagent::session::TransportKind;
use microagent::tool::{Terminate, Tool};

use crate::configuration::ServerSettings;

const LOCAL_SERVER_ID: &str = "local";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const EXIT_WORDS: &[&str] = &["exit", "quit", "q"];

/// Owns the shared client and federation and runs one agent per prompt
pub struct Runner {
    agent_config: AgentConfig,
    client: Arc<ModelClient>,
    federation: Arc<ToolFederation>,
    servers: Vec<ServerSettings>,
    sink: Option<Arc<dyn RecordSink>>,
}

impl Runner {
    pub fn new(
        agent_config: AgentConfig,
        client: ModelClient,
        servers: Vec<ServerSettings>,
        sink: Option<Arc<dyn RecordSink>>,
    ) -> Self {
        Self {
            agent_config,
            client: Arc::new(client),
            federation: Arc::new(ToolFederation::new()),
            servers,
            sink,
        }
    }

    pub fn federation(&self) -> &Arc<ToolFederation> {
        &self.federation
    }

    /// Connect every configured server plus the built-in terminate tool
    ///
    /// A server that fails to connect is reported and skipped.
    pub async fn connect_servers(&self) -> Result<()> {
        let specs = self
            .servers
            .iter()
            .map(|s| (s.id.clone(), s.transport.clone()))
            .collect();
        for result in self.federation.connect_many(specs).await {
            match result {
                Ok(server_id) => println!("{} {}", style("connected").green(), server_id),
                Err(e) => {
                    warn!(error = %e, "skipping tool server");
                    println!("{} {}", style("failed").red(), e);
                }
            }
        }

        let builtin: Vec<Arc<dyn Tool>> = vec![Arc::new(Terminate)];
        self.federation
            .attach(
                Some(LOCAL_SERVER_ID),
                TransportKind::Local,
                Box::new(LocalTransport::new(builtin)),
            )
            .await?;

        let tools = self.federation.tool_names().await;
        println!("{} {}", style("tools:").dim(), tools.join(", "));
        Ok(())
    }

    /// Run a fresh agent on `prompt`, reconnecting first if an earlier run disconnected
    pub async fn run_prompt(&self, prompt: &str) -> Result<Transcript> {
        if self.federation.is_empty().await {
            self.connect_servers().await?;
        }

        let mut agent = Agent::new(
            self.agent_config.clone(),
            self.client.clone(),
            self.federation.clone(),
        );
        if let Some(sink) = &self.sink {
            agent = agent.with_sink(sink.clone());
        }

        let spinner = cliclack::spinner();
        spinner.start("working...");
        let result = agent.run(Some(prompt)).await;
        spinner.stop(format!("{}", agent.state()));

        let transcript = result?;
        for step in &transcript.steps {
            print_step(step);
        }
        let usage = transcript.total_usage();
        println!(
            "{}",
            style(format!(
                "{} steps, {} input / {} output tokens",
                transcript.len(),
                usage.input_tokens,
                usage.output_tokens
            ))
            .dim()
        );
        Ok(transcript)
    }

    /// Read prompts until the user types an exit word
    pub async fn interactive(&self) -> Result<()> {
        loop {
            let prompt: String = cliclack::input("Enter your request")
                .placeholder("exit, quit or q to leave")
                .interact()?;
            let prompt = prompt.trim();
            if EXIT_WORDS.contains(&prompt.to_lowercase().as_str()) {
                break;
            }
            if prompt.is_empty() {
                continue;
            }
            if let Err(e) = self.run_prompt(prompt).await {
                println!("{} {}", style("error:").red().bold(), e);
            }
        }
        Ok(())
    }

    /// Disconnect everything and wait briefly for the servers to close
    pub async fn shutdown(&self) {
        self.federation.disconnect_all().await;
        for error in self.federation.shutdown(SHUTDOWN_GRACE).await {
            warn!(error = %error, "tool server did not close cleanly");
        }
    }
}

fn print_step(step: &StepRecord) {
    println!("{}", style(format!("step {}", step.step)).cyan().bold());
    if let Some(thought) = &step.thought {
        println!("{}", thought);
    }
    for call in &step.tool_calls {
        println!("{} {} {}", style("→").yellow(), style(&call.name).yellow(), call.arguments);
    }
    for result in &step.tool_results {
        let output = style(&result.output);
        if result.is_error {
            println!("{}", output.red());
        } else {
            println!("{}", output.dim());
        }
    }
    if let Some(error) = &step.error {
        println!("{} {}", style("error:").red(), error);
    }
}
