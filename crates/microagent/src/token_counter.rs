use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};
use tracing::{info, warn};

use crate::errors::LlmError;
use crate::models::content::{Content, ImageContent, ImageDetail};
use crate::models::message::Message;
use crate::models::tool::ToolSchema;
use crate::providers::base::TokenUsage;
use crate::providers::utils::tools_to_openai_spec;

const FORMAT_TOKENS: u64 = 2;
const BASE_MESSAGE_TOKENS: u64 = 4;
const LOW_DETAIL_IMAGE_TOKENS: u64 = 85;
const HIGH_DETAIL_TILE_TOKENS: u64 = 170;
const MEDIUM_DETAIL_DEFAULT_TOKENS: u64 = 1024;

const MAX_SIZE: u64 = 2048;
const HIGH_DETAIL_TARGET_SHORT_SIDE: u64 = 768;
const TILE_SIZE: u64 = 512;

/// Counts tokens for chat messages using the BPE encoding of a model
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Option<Arc<CoreBPE>>,
}

impl TokenCounter {
    /// Load the encoding for `model`, falling back to cl100k_base for unknown models
    pub fn new(model: &str) -> Self {
        let bpe = match get_bpe_from_model(model) {
            Ok(bpe) => Some(bpe),
            Err(_) => match cl100k_base() {
                Ok(bpe) => Some(bpe),
                Err(e) => {
                    warn!(model, error = %e, "failed to load tokenizer, estimating by length");
                    None
                }
            },
        };
        Self {
            bpe: bpe.map(Arc::new),
        }
    }

    pub fn count_text(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => (text.chars().count() as u64).div_ceil(4),
        }
    }

    /// Cost of one image part, by detail level and dimensions
    pub fn count_image(&self, image: &ImageContent) -> u64 {
        match (image.detail, image.dimensions) {
            (ImageDetail::Low, _) => LOW_DETAIL_IMAGE_TOKENS,
            (ImageDetail::High | ImageDetail::Medium, Some((width, height))) => {
                high_detail_tokens(width as u64, height as u64)
            }
            (ImageDetail::High, None) => high_detail_tokens(1024, 1024),
            _ => MEDIUM_DETAIL_DEFAULT_TOKENS,
        }
    }

    pub fn count_content(&self, content: &[Content]) -> u64 {
        content
            .iter()
            .map(|part| match part {
                Content::Text(text) => self.count_text(&text.text),
                Content::Image(image) => self.count_image(image),
            })
            .sum()
    }

    pub fn count_message(&self, message: &Message) -> u64 {
        let mut tokens = BASE_MESSAGE_TOKENS;
        tokens += self.count_text(message.role.as_str());
        tokens += self.count_content(&message.content);
        for call in &message.tool_calls {
            tokens += self.count_text(&call.name);
            tokens += self.count_text(&call.arguments.to_string());
        }
        tokens += message.name.as_deref().map_or(0, |n| self.count_text(n));
        tokens += message
            .tool_call_id
            .as_deref()
            .map_or(0, |id| self.count_text(id));
        tokens
    }

    pub fn count_messages(&self, messages: &[Message]) -> u64 {
        FORMAT_TOKENS + messages.iter().map(|m| self.count_message(m)).sum::<u64>()
    }

    /// Each tool costs the tokens of its serialized function spec
    pub fn count_tools(&self, tools: &[ToolSchema]) -> u64 {
        match tools_to_openai_spec(tools) {
            Ok(specs) => specs.iter().map(|s| self.count_text(&s.to_string())).sum(),
            Err(_) => tools
                .iter()
                .map(|t| {
                    self.count_text(&t.name)
                        + self.count_text(&t.description)
                        + self.count_text(&t.input_schema.to_string())
                })
                .sum(),
        }
    }
}

fn high_detail_tokens(mut width: u64, mut height: u64) -> u64 {
    if width == 0 || height == 0 {
        return LOW_DETAIL_IMAGE_TOKENS;
    }

    if width > MAX_SIZE || height > MAX_SIZE {
        let scale = MAX_SIZE as f64 / width.max(height) as f64;
        width = (width as f64 * scale) as u64;
        height = (height as f64 * scale) as u64;
    }

    let scale = HIGH_DETAIL_TARGET_SHORT_SIDE as f64 / width.min(height) as f64;
    let scaled_width = (width as f64 * scale) as u64;
    let scaled_height = (height as f64 * scale) as u64;

    let tiles = scaled_width.div_ceil(TILE_SIZE) * scaled_height.div_ceil(TILE_SIZE);
    tiles * HIGH_DETAIL_TILE_TOKENS + LOW_DETAIL_IMAGE_TOKENS
}

/// Cumulative token bookkeeping with an optional input budget
pub struct TokenAccountant {
    counter: TokenCounter,
    max_input_tokens: Option<u64>,
    total_input: AtomicU64,
    total_output: AtomicU64,
}

impl TokenAccountant {
    pub fn new(counter: TokenCounter, max_input_tokens: Option<u64>) -> Self {
        Self {
            counter,
            max_input_tokens,
            total_input: AtomicU64::new(0),
            total_output: AtomicU64::new(0),
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn count(&self, messages: &[Message], tools: &[ToolSchema]) -> u64 {
        self.counter.count_messages(messages) + self.counter.count_tools(tools)
    }

    /// Check that `requested` more input tokens fit the budget, without recording them
    ///
    /// The check runs on the local estimate while `record` takes the provider's own count,
    /// so one call may overshoot the maximum by the estimation error. Once over, every
    /// further reservation fails.
    pub fn reserve(&self, requested: u64) -> Result<(), LlmError> {
        let Some(max) = self.max_input_tokens else {
            return Ok(());
        };
        let used = self.total_input.load(Ordering::SeqCst);
        if used.saturating_add(requested) > max {
            return Err(LlmError::TokenLimitExceeded {
                used,
                requested,
                max,
            });
        }
        Ok(())
    }

    pub fn record(&self, usage: TokenUsage) {
        let input = self
            .total_input
            .fetch_add(usage.input_tokens, Ordering::SeqCst)
            + usage.input_tokens;
        let output = self
            .total_output
            .fetch_add(usage.output_tokens, Ordering::SeqCst)
            + usage.output_tokens;
        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            total_input = input,
            total_output = output,
            "token usage"
        );
        if let Some(max) = self.max_input_tokens.filter(|max| input > *max) {
            warn!(total_input = input, max, "input token budget exhausted");
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_input_tokens
            .is_some_and(|max| self.total_input.load(Ordering::SeqCst) > max)
    }

    pub fn totals(&self) -> TokenUsage {
        TokenUsage::new(
            self.total_input.load(Ordering::SeqCst),
            self.total_output.load(Ordering::SeqCst),
        )
    }

    pub fn max_input_tokens(&self) -> Option<u64> {
        self.max_input_tokens
    }
}
