use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: set {env_var} or add it to the config file")]
    MissingEnvVar { env_var: String },

    #[error("Unknown llm profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid server entry '{server}': {reason}")]
    InvalidServer { server: String, reason: String },

    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

/// Map a dotted config path to the environment variable that sets it
///
/// `llm.api_key` becomes `MICROAGENT_LLM__API_KEY`.
pub fn to_env_var(field: &str) -> String {
    format!("MICROAGENT_{}", field.replace('.', "__").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("llm.api_key"), "MICROAGENT_LLM__API_KEY");
        assert_eq!(to_env_var("model"), "MICROAGENT_MODEL");
    }
}
