use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tera::{Context, Error as TeraError, Tera};

pub const SYSTEM_PROMPT: &str = "system.md";
pub const NEXT_STEP_PROMPT: &str = "next_step.md";
pub const MULTIMEDIA_PROMPT: &str = "multimedia.md";
pub const STUCK_PROMPT: &str = "stuck.md";

/// Prompts compiled into the crate, usable without a source checkout
const BUILTIN_PROMPTS: &[(&str, &str)] = &[
    (SYSTEM_PROMPT, include_str!("prompts/system.md")),
    (NEXT_STEP_PROMPT, include_str!("prompts/next_step.md")),
    (MULTIMEDIA_PROMPT, include_str!("prompts/multimedia.md")),
    (STUCK_PROMPT, include_str!("prompts/stuck.md")),
];

/// Get the path to the prompts directory
fn prompts_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir).join("src").join("prompts")
}

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

pub fn load_prompt_file<T: Serialize>(
    template_file: impl Into<PathBuf>,
    context_data: &T,
) -> Result<String, TeraError> {
    let template_path = template_file.into();
    // relative names fall back to the prompts directory
    let file_path = if !template_path.exists() {
        prompts_dir().join(template_path)
    } else {
        template_path
    };

    let template_content = fs::read_to_string(file_path)
        .map_err(|e| TeraError::chain("Failed to read template file", e))?;
    load_prompt(&template_content, context_data)
}

/// Render one of the built-in prompts, trimmed of surrounding whitespace
pub fn builtin_prompt<T: Serialize>(name: &str, context_data: &T) -> Result<String, TeraError> {
    let template = BUILTIN_PROMPTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| *t)
        .ok_or_else(|| TeraError::msg(format!("Unknown built-in prompt: {}", name)))?;
    Ok(load_prompt(template, context_data)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolSchema;
    use serde_json::json;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_load_prompt() {
        let template = "Hello, {{ name }}! You are {{ age }} years old.";
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        context.insert("age".to_string(), 30.to_string());

        let result = load_prompt(template, &context).unwrap();
        assert_eq!(result, "Hello, Alice! You are 30 years old.");
    }

    #[test]
    fn test_load_prompt_missing_variable() {
        let template = "Hello, {{ name }}! You are {{ age }} years old.";
        let mut context = HashMap::new();
        context.insert("name".to_string(), "Alice".to_string());
        let result = load_prompt(template, &context);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_prompt_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test_template.txt");
        fs::write(&file_path, "Hello, {{ name }}!").unwrap();

        let mut context = HashMap::new();
        context.insert("name".to_string(), "Bob".to_string());

        let result = load_prompt_file(file_path, &context).unwrap();
        assert_eq!(result, "Hello, Bob!");
    }

    #[test]
    fn test_load_prompt_file_from_prompts_dir() {
        let mut context = HashMap::new();
        context.insert("tool_name".to_string(), "stdio_0_screenshot".to_string());
        let result = load_prompt_file(MULTIMEDIA_PROMPT, &context).unwrap();
        assert!(result.contains("`stdio_0_screenshot`"));
    }

    #[test]
    fn test_load_prompt_file_missing_file() {
        let context: HashMap<String, String> = HashMap::new();
        let result = load_prompt_file("non_existent_template.txt", &context);
        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_prompts() {
        let empty: HashMap<String, String> = HashMap::new();
        let stuck = builtin_prompt(STUCK_PROMPT, &empty).unwrap();
        assert_eq!(
            stuck,
            "Observed duplicate responses. Consider new strategies and avoid repeating ineffective paths already attempted."
        );
        assert!(builtin_prompt(SYSTEM_PROMPT, &empty).unwrap().contains("terminate"));
        assert!(builtin_prompt("missing.md", &empty).is_err());
    }

    #[test]
    fn test_load_prompt_with_tools() {
        let template = "### Tool Descriptions\n{% for tool in tools %}\n{{tool.name}}: {{tool.description}}{% endfor %}";

        let tools = vec![
            ToolSchema::new(
                "stdio_0_echo",
                "Echo the text back",
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            ),
            ToolSchema::new(
                "sse_1_weather",
                "Gets weather information",
                json!({"type": "object", "properties": {"location": {"type": "string"}}}),
            ),
        ];

        let mut context = HashMap::new();
        context.insert("tools".to_string(), tools);

        let result = load_prompt(template, &context).unwrap();
        let expected = "### Tool Descriptions\n\nstdio_0_echo: Echo the text back\nsse_1_weather: Gets weather information";
        assert_eq!(result, expected);
    }
}
