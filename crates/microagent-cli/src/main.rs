mod configuration;
mod error;
mod runner;
mod session_file;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use microagent::model_client::ModelClient;
use microagent::providers::openai::OpenAiProvider;
use microagent::record::RecordSink;

use configuration::{ServerSettings, Settings};
use runner::Runner;
use session_file::{ensure_record_dir, JsonRecordSink};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file; defaults to config/config.toml or config/config.example.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named [llm.<profile>] table to use instead of [llm]
    #[arg(long)]
    llm: Option<String>,

    /// Connect a single server from the command line instead of [[servers]]
    #[arg(long, value_enum)]
    connection: Option<Connection>,

    /// URL of the SSE tool server
    #[arg(long)]
    server_url: Option<String>,

    /// Command that starts the stdio tool server
    #[arg(long)]
    command: Option<String>,

    /// Argument for the stdio command, repeatable
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Run once on this prompt
    #[arg(short, long)]
    prompt: Option<String>,

    /// Keep reading prompts until exit
    #[arg(short, long)]
    interactive: bool,

    /// Where transcripts are written
    #[arg(long)]
    record_dir: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum Connection {
    Stdio,
    Sse,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn servers(cli: &Cli, settings: &Settings) -> Result<Vec<ServerSettings>> {
    Ok(match cli.connection {
        Some(Connection::Stdio) => vec![ServerSettings::stdio(cli.command.clone(), cli.args.clone())?],
        Some(Connection::Sse) => vec![ServerSettings::sse(cli.server_url.clone())?],
        None => settings.servers.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    let llm = settings.llm_profile(cli.llm.as_deref())?;
    let provider = Arc::new(OpenAiProvider::new(llm.provider_config())?);
    let client = ModelClient::new(provider, llm.client_config());

    let record_dir = ensure_record_dir(cli.record_dir.clone())?;
    let sink: Arc<dyn RecordSink> = Arc::new(JsonRecordSink::new(record_dir));
    let runner = Runner::new(
        settings.agent.agent_config(),
        client,
        servers(&cli, &settings)?,
        Some(sink),
    );

    runner.connect_servers().await?;
    let result = if cli.interactive {
        runner.interactive().await
    } else {
        let prompt = match cli.prompt.clone() {
            Some(prompt) => prompt,
            None => cliclack::input("Enter your prompt").interact()?,
        };
        runner.run_prompt(&prompt).await.map(|_| ())
    };

    runner.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_stdio_flags() {
        let cli = Cli::parse_from([
            "microagent",
            "--connection",
            "stdio",
            "--command",
            "python",
            "--arg",
            "-m",
            "--arg",
            "tools.server",
            "-p",
            "say hi",
        ]);
        assert_eq!(cli.args, vec!["-m".to_string(), "tools.server".to_string()]);
        assert_eq!(cli.prompt.as_deref(), Some("say hi"));
        assert!(!cli.interactive);
        assert!(matches!(cli.connection, Some(Connection::Stdio)));
    }
}
