use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{LlmError, ProviderError};
use crate::models::content::{Content, ImageDetail};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::ToolSchema;
use crate::providers::base::{CompletionRequest, Provider, TokenUsage, ToolChoice};
use crate::providers::configs::DEFAULT_TIMEOUT_SECS;
use crate::providers::utils::tools_to_openai_spec;
use crate::retry::RetryPolicy;
use crate::token_counter::{TokenAccountant, TokenCounter};

pub const REASONING_MODELS: &[&str] = &["o1", "o3-mini"];
pub const MULTIMODAL_MODELS: &[&str] = &[
    "gpt-4-vision-preview",
    "gpt-4o",
    "gpt-4o-mini",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelClientConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Cumulative input budget across all calls; None means unlimited
    pub max_input_tokens: Option<u64>,
    pub timeout: Duration,
    pub multimodal_models: Vec<String>,
    pub reasoning_models: Vec<String>,
}

impl ModelClientConfig {
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            temperature: 1.0,
            max_input_tokens: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            multimodal_models: MULTIMODAL_MODELS.iter().map(|m| m.to_string()).collect(),
            reasoning_models: REASONING_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// The model's answer to one tool-calling request
#[derive(Debug, Clone)]
pub struct Decision {
    /// None when the model returned no choices
    pub turn: Option<Message>,
    pub usage: TokenUsage,
}

/// An image to attach to the trailing user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageInput {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        detail: ImageDetail,
    },
}

impl ImageInput {
    fn into_content(self) -> Content {
        match self {
            ImageInput::Url(url) => Content::image(url),
            ImageInput::Detailed { url, detail } => Content::image(url).with_detail(detail),
        }
    }
}

/// Turns chat history into validated model calls with budgeting and retries
pub struct ModelClient {
    provider: Arc<dyn Provider>,
    config: ModelClientConfig,
    accountant: TokenAccountant,
    retry: RetryPolicy,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn Provider>, config: ModelClientConfig) -> Self {
        let accountant =
            TokenAccountant::new(TokenCounter::new(&config.model), config.max_input_tokens);
        Self {
            provider,
            config,
            accountant,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ModelClientConfig {
        &self.config
    }

    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }

    pub fn supports_images(&self) -> bool {
        self.config
            .multimodal_models
            .iter()
            .any(|m| m == &self.config.model)
    }

    pub fn is_reasoning_model(&self) -> bool {
        self.config
            .reasoning_models
            .iter()
            .any(|m| m == &self.config.model)
    }

    /// Resolve inline images and drop messages with nothing to send
    pub fn format_messages(messages: &[Message], supports_images: bool) -> Vec<Message> {
        messages
            .iter()
            .cloned()
            .filter_map(|mut message| {
                if let Some(data) = message.base64_image.take() {
                    if supports_images {
                        message.content.push(Content::base64_image(data));
                    }
                }
                (!message.is_empty()).then_some(message)
            })
            .collect()
    }

    fn merge(&self, messages: &[Message], system_messages: &[Message], images: bool) -> Vec<Message> {
        let mut merged = Self::format_messages(system_messages, images);
        merged.extend(Self::format_messages(messages, images));
        merged
    }

    fn request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
        tool_choice: Option<ToolChoice>,
        temperature: Option<f32>,
    ) -> CompletionRequest {
        CompletionRequest {
            messages,
            tools,
            tool_choice,
            temperature: Some(temperature.unwrap_or(self.config.temperature)),
            max_tokens: self.config.max_tokens,
            reasoning: self.is_reasoning_model(),
        }
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, LlmError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Provider(ProviderError::Timeout(self.config.timeout))),
        }
    }

    /// Ask the model for its next turn, offering `tools`
    pub async fn decide(
        &self,
        messages: &[Message],
        system_messages: &[Message],
        tools: &[ToolSchema],
        tool_choice: ToolChoice,
    ) -> Result<Decision, LlmError> {
        if tool_choice == ToolChoice::Required && tools.is_empty() {
            return Err(LlmError::Validation(
                "tool_choice 'required' needs at least one tool".to_string(),
            ));
        }
        tools_to_openai_spec(tools)?;

        let formatted = self.merge(messages, system_messages, self.supports_images());
        let input_tokens = self.accountant.count(&formatted, tools);
        self.accountant.reserve(input_tokens)?;

        let request = self.request(formatted, tools.to_vec(), Some(tool_choice), None);
        let completion = self
            .retry
            .run(move || {
                let request = request.clone();
                self.with_deadline(async move {
                    self.provider.complete(request).await.map_err(LlmError::from)
                })
            })
            .await?;

        let Some(turn) = completion.message else {
            debug!("model returned no choices");
            return Ok(Decision {
                turn: None,
                usage: TokenUsage::default(),
            });
        };

        let usage = completion.usage.unwrap_or_else(|| {
            let output = self.accountant.counter().count_message(&turn);
            TokenUsage::new(input_tokens, output)
        });
        self.accountant.record(usage);
        info!(
            tool_calls = turn.tool_calls.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "model decided"
        );

        Ok(Decision {
            turn: Some(turn),
            usage,
        })
    }

    /// Plain completion, returning the model's text
    pub async fn ask(
        &self,
        messages: &[Message],
        system_messages: &[Message],
        stream: bool,
        temperature: Option<f32>,
    ) -> Result<String, LlmError> {
        let formatted = self.merge(messages, system_messages, self.supports_images());
        self.complete_text(formatted, stream, temperature).await
    }

    /// Plain completion with images attached to the trailing user message
    pub async fn ask_with_images(
        &self,
        messages: &[Message],
        images: Vec<ImageInput>,
        system_messages: &[Message],
        stream: bool,
        temperature: Option<f32>,
    ) -> Result<String, LlmError> {
        if !self.supports_images() {
            return Err(LlmError::Validation(format!(
                "Model {} does not support images. Use one of: {}",
                self.config.model,
                self.config.multimodal_models.join(", ")
            )));
        }

        let mut formatted = Self::format_messages(messages, true);
        let last = formatted
            .last_mut()
            .filter(|m| m.role == Role::User)
            .ok_or_else(|| {
                LlmError::Validation(
                    "The last message must be from the user to attach images".to_string(),
                )
            })?;
        last.content
            .extend(images.into_iter().map(ImageInput::into_content));

        let mut all = Self::format_messages(system_messages, true);
        all.extend(formatted);
        self.complete_text(all, stream, temperature).await
    }

    async fn complete_text(
        &self,
        formatted: Vec<Message>,
        stream: bool,
        temperature: Option<f32>,
    ) -> Result<String, LlmError> {
        let input_tokens = self.accountant.count(&formatted, &[]);
        self.accountant.reserve(input_tokens)?;
        let request = self.request(formatted, Vec::new(), None, temperature);

        self.retry
            .run(move || {
                let request = request.clone();
                self.with_deadline(async move {
                    if stream {
                        self.stream_once(request, input_tokens).await
                    } else {
                        self.complete_once(request).await
                    }
                })
            })
            .await
    }

    async fn complete_once(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let completion = self.provider.complete(request).await?;
        let text = completion
            .message
            .map(|m| m.text())
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;
        if let Some(usage) = completion.usage {
            self.accountant.record(usage);
        }
        Ok(text)
    }

    async fn stream_once(
        &self,
        request: CompletionRequest,
        input_tokens: u64,
    ) -> Result<String, LlmError> {
        // Streams report no usage, so the input estimate is recorded up front
        self.accountant.record(TokenUsage::new(input_tokens, 0));

        let chunks: Vec<String> = self.provider.stream(request).await?.try_collect().await?;
        let completion_text = chunks.concat();
        let full_response = completion_text.trim();
        if full_response.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let completion_tokens = self.accountant.counter().count_text(&completion_text);
        debug!(completion_tokens, "estimated completion tokens for streamed response");
        self.accountant.record(TokenUsage::new(0, completion_tokens));
        Ok(full_response.to_string())
    }
}
