use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment, File};
use microagent::agent::AgentConfig;
use microagent::model_client::ModelClientConfig;
use microagent::providers::base::ToolChoice;
use microagent::providers::configs::OpenAiProviderConfig;
use microagent::session::TransportSpec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Model settings; `[llm]` is the default profile
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub max_input_tokens: Option<u64>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// A named profile; unset fields fall back to the default profile
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LlmOverride {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub max_input_tokens: Option<u64>,
    pub temperature: Option<f32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(flatten)]
    pub default: LlmSettings,
    #[serde(flatten)]
    pub profiles: HashMap<String, LlmOverride>,
}

impl LlmSettings {
    fn apply(&self, profile: &LlmOverride) -> LlmSettings {
        LlmSettings {
            model: profile.model.clone().unwrap_or_else(|| self.model.clone()),
            base_url: profile.base_url.clone().unwrap_or_else(|| self.base_url.clone()),
            api_key: profile.api_key.clone().unwrap_or_else(|| self.api_key.clone()),
            max_tokens: profile.max_tokens.unwrap_or(self.max_tokens),
            max_input_tokens: profile.max_input_tokens.or(self.max_input_tokens),
            temperature: profile.temperature.unwrap_or(self.temperature),
            timeout_secs: profile.timeout_secs.unwrap_or(self.timeout_secs),
        }
    }

    pub fn provider_config(&self) -> OpenAiProviderConfig {
        OpenAiProviderConfig::new(&self.base_url, &self.api_key, &self.model)
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }

    pub fn client_config(&self) -> ModelClientConfig {
        let mut config = ModelClientConfig::new(&self.model);
        config.max_tokens = self.max_tokens;
        config.max_input_tokens = self.max_input_tokens;
        config.temperature = self.temperature;
        config.timeout = Duration::from_secs(self.timeout_secs);
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub next_step_prompt: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u32,
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: usize,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    #[serde(default = "default_terminal_tools")]
    pub terminal_tools: Vec<String>,
    #[serde(default = "default_true")]
    pub stop_on_token_limit: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            system_prompt: None,
            next_step_prompt: None,
            max_steps: default_max_steps(),
            refresh_interval: default_refresh_interval(),
            stuck_threshold: default_stuck_threshold(),
            tool_choice: ToolChoice::default(),
            terminal_tools: default_terminal_tools(),
            stop_on_token_limit: true,
        }
    }
}

impl AgentSettings {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            name: self.name.clone(),
            system_prompt: self.system_prompt.clone(),
            next_step_prompt: self.next_step_prompt.clone(),
            max_steps: self.max_steps,
            refresh_interval: self.refresh_interval,
            terminal_tools: self.terminal_tools.clone(),
            stuck_threshold: self.stuck_threshold,
            tool_choice: self.tool_choice,
            stop_on_token_limit: self.stop_on_token_limit,
        }
    }
}

/// One `[[servers]]` entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub transport: TransportSpec,
}

impl ServerSettings {
    pub fn stdio(command: Option<String>, args: Vec<String>) -> Result<Self, ConfigError> {
        let command = command.ok_or_else(|| ConfigError::InvalidServer {
            server: "stdio".to_string(),
            reason: "--command is required for stdio connections".to_string(),
        })?;
        Ok(Self {
            id: None,
            transport: TransportSpec::stdio(command, args),
        })
    }

    pub fn sse(url: Option<String>) -> Result<Self, ConfigError> {
        let url = url.ok_or_else(|| ConfigError::InvalidServer {
            server: "sse".to_string(),
            reason: "--server-url is required for sse connections".to_string(),
        })?;
        Ok(Self {
            id: None,
            transport: TransportSpec::sse(url),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub llm: LlmSection,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub servers: Vec<ServerSettings>,
}

impl Settings {
    /// Load from `path`, or the first default config file found, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("llm.model", default_model())?
            .set_default("llm.base_url", default_base_url())?;

        match path {
            Some(path) => builder = builder.add_source(File::from(path).required(true)),
            None => {
                if let Some(found) = default_config_files().into_iter().find(|p| p.exists()) {
                    tracing::debug!(path = %found.display(), "loading config file");
                    builder = builder.add_source(File::from(found).required(false));
                }
            }
        }

        let config = builder
            .add_source(
                Environment::with_prefix("MICROAGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    // "missing field `api_key`"
                    let field = error_str.split('`').nth(1).unwrap_or_default();
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(&qualify(field)),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }

    /// The default profile, or `name` layered over it
    pub fn llm_profile(&self, name: Option<&str>) -> Result<LlmSettings, ConfigError> {
        match name {
            None | Some("default") => Ok(self.llm.default.clone()),
            Some(name) => self
                .llm
                .profiles
                .get(name)
                .map(|profile| self.llm.default.apply(profile))
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string())),
        }
    }
}

/// Dotted path of a field that may be missing from the config
fn qualify(field: &str) -> String {
    match field {
        "api_key" | "model" | "base_url" => format!("llm.{}", field),
        other => other.to_string(),
    }
}

fn default_config_files() -> Vec<PathBuf> {
    let mut files = vec![
        PathBuf::from("config/config.toml"),
        PathBuf::from("config/config.example.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        files.push(dir.join("microagent").join("config.toml"));
    }
    files
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    1.0
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_agent_name() -> String {
    "microagent".to_string()
}

fn default_max_steps() -> u32 {
    40
}

fn default_refresh_interval() -> u32 {
    5
}

fn default_stuck_threshold() -> usize {
    3
}

fn default_terminal_tools() -> Vec<String> {
    vec!["terminate".to_string()]
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("MICROAGENT_") {
                env::remove_var(&key);
            }
        }
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    #[serial]
    fn test_defaults_from_env() {
        clean_env();
        env::set_var("MICROAGENT_LLM__API_KEY", "test-key");

        let (_dir, path) = write_config("");
        let settings = Settings::load(Some(&path)).unwrap();
        let llm = settings.llm_profile(None).unwrap();
        assert_eq!(llm.api_key, "test-key");
        assert_eq!(llm.model, "gpt-4o");
        assert_eq!(llm.max_tokens, 4096);
        assert_eq!(llm.temperature, 1.0);
        assert_eq!(llm.max_input_tokens, None);

        assert_eq!(settings.agent.max_steps, 40);
        assert_eq!(settings.agent.refresh_interval, 5);
        assert_eq!(settings.agent.tool_choice, ToolChoice::Auto);
        assert!(settings.servers.is_empty());

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_api_key() {
        clean_env();
        let (_dir, path) = write_config("[llm]\nmodel = \"gpt-4o-mini\"\n");
        match Settings::load(Some(&path)) {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "MICROAGENT_LLM__API_KEY")
            }
            other => panic!("expected missing env var, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_file_with_profiles_and_servers() {
        clean_env();
        let (_dir, path) = write_config(
            r#"
[llm]
model = "gpt-4o"
api_key = "file-key"
max_input_tokens = 100000

[llm.reasoning]
model = "o3-mini"
max_tokens = 2048

[agent]
max_steps = 12
tool_choice = "required"

[[servers]]
type = "stdio"
command = "python"
args = ["-m", "tools.server"]

[[servers]]
id = "remote"
type = "sse"
url = "http://127.0.0.1:8000/sse"
"#,
        );
        env::set_var("MICROAGENT_LLM__TEMPERATURE", "0.2");

        let settings = Settings::load(Some(&path)).unwrap();
        let default = settings.llm_profile(None).unwrap();
        assert_eq!(default.temperature, 0.2);
        assert_eq!(default.max_input_tokens, Some(100000));

        let reasoning = settings.llm_profile(Some("reasoning")).unwrap();
        assert_eq!(reasoning.model, "o3-mini");
        assert_eq!(reasoning.max_tokens, 2048);
        assert_eq!(reasoning.api_key, "file-key");
        assert!(matches!(
            settings.llm_profile(Some("missing")),
            Err(ConfigError::UnknownProfile(_))
        ));

        assert_eq!(settings.agent.max_steps, 12);
        assert_eq!(settings.agent.tool_choice, ToolChoice::Required);

        assert_eq!(settings.servers.len(), 2);
        assert_eq!(
            settings.servers[0].transport,
            TransportSpec::stdio("python", vec!["-m".into(), "tools.server".into()])
        );
        assert_eq!(settings.servers[1].id.as_deref(), Some("remote"));
        assert_eq!(
            settings.servers[1].transport,
            TransportSpec::sse("http://127.0.0.1:8000/sse")
        );

        clean_env();
    }

    #[test]
    fn test_server_flags() {
        assert!(ServerSettings::stdio(None, vec![]).is_err());
        assert!(ServerSettings::sse(None).is_err());
        let server = ServerSettings::sse(Some("http://localhost:8000/sse".into())).unwrap();
        assert_eq!(server.transport, TransportSpec::sse("http://localhost:8000/sse"));
    }

    #[test]
    fn test_client_config() {
        let llm = LlmSettings {
            model: "o1".into(),
            base_url: default_base_url(),
            api_key: "key".into(),
            max_tokens: 1000,
            max_input_tokens: Some(5000),
            temperature: 0.5,
            timeout_secs: 30,
        };
        let config = llm.client_config();
        assert_eq!(config.model, "o1");
        assert_eq!(config.max_input_tokens, Some(5000));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(llm.provider_config().model, "o1");
    }
}
