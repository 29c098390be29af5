use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use super::base::{ChunkStream, Completion, CompletionRequest, Provider, TokenUsage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    check_openai_context_length_error, messages_to_openai_spec, openai_response_to_message,
    tools_to_openai_spec,
};
use crate::errors::ProviderError;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Option<TokenUsage> {
        let usage = data.get("usage")?;
        let input_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;
        let output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Some(TokenUsage::new(input_tokens, output_tokens))
    }

    fn build_payload(&self, request: &CompletionRequest, stream: bool) -> Result<Value, ProviderError> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_to_openai_spec(&request.messages),
        });

        if !request.tools.is_empty() {
            let tools_spec = tools_to_openai_spec(&request.tools).map_err(|e| {
                ProviderError::BadRequest {
                    status: 400,
                    message: e.to_string(),
                }
            })?;
            payload["tools"] = json!(tools_spec);
        }
        if let Some(choice) = request.tool_choice {
            payload["tool_choice"] = json!(choice.as_str());
        }
        if request.reasoning {
            payload["max_completion_tokens"] = json!(request.max_tokens);
        } else {
            payload["max_tokens"] = json!(request.max_tokens);
            if let Some(temperature) = request.temperature {
                payload["temperature"] = json!(temperature);
            }
        }
        if stream {
            payload["stream"] = json!(true);
        }
        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<Response, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(url = %url, model = %self.config.model, "sending chat completion");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.config.timeout)
                } else {
                    ProviderError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"error": {"message": status.to_string()}}));
        let error = body.get("error").cloned().unwrap_or(body);
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::Authentication(message)
            }
            s if s.is_server_error() => ProviderError::Server {
                status: s.as_u16(),
                message,
            },
            s => check_openai_context_length_error(&error).unwrap_or(ProviderError::BadRequest {
                status: s.as_u16(),
                message,
            }),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let payload = self.build_payload(&request, false)?;
        let response: Value = self.post(&payload).await?.json().await?;

        // Raise specific error if context length is exceeded
        if let Some(error) = response.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err);
            }
            return Err(ProviderError::Decode(format!("OpenAI API error: {}", error)));
        }

        Ok(Completion {
            message: openai_response_to_message(&response),
            usage: Self::get_usage(&response),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let payload = self.build_payload(&request, true)?;
        let response = self.post(&payload).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer = LineBuffer::default();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(ProviderError::from)?;
                for line in buffer.push(&chunk)? {
                    match parse_stream_line(&line)? {
                        StreamLine::Delta(text) => yield text,
                        StreamLine::Done => break 'outer,
                        StreamLine::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Raw body bytes held until a full line arrives
///
/// Network chunks may end inside a multi-byte character, so only complete lines are decoded.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.bytes.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=newline).collect();
            let line = String::from_utf8(line).map_err(|e| ProviderError::Decode(e.to_string()))?;
            lines.push(line.trim().to_string());
        }
        Ok(lines)
    }
}

#[derive(Debug, PartialEq)]
enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

/// Parse one server-sent event line of a streamed completion
fn parse_stream_line(line: &str) -> Result<StreamLine, ProviderError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }
    let value: Value =
        serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
    if let Some(error) = value.get("error") {
        return Err(ProviderError::Decode(format!("OpenAI API error: {}", error)));
    }
    match value["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(StreamLine::Delta(text.to_string())),
        _ => Ok(StreamLine::Skip),
    }
}
