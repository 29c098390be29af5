use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::providers::base::{
    ChunkStream, Completion, CompletionRequest, Provider, TokenUsage,
};

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    model: String,
    responses: Arc<Mutex<VecDeque<Result<Message, ProviderError>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    /// Create a mock provider that may also fail on some calls
    pub fn with_results(responses: Vec<Result<Message, ProviderError>>) -> Self {
        Self {
            model: "mock".to_string(),
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }

    /// Requests received so far, in order
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    async fn next(&self, request: CompletionRequest) -> Result<Message, ProviderError> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            // Return empty response if no more pre-configured responses
            .unwrap_or_else(|| Ok(Message::assistant().with_text("")))
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let message = self.next(request).await?;
        Ok(Completion {
            message: Some(message),
            usage: Some(TokenUsage::new(10, 5)),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let text = self.next(request).await?.text();
        let chunks: Vec<Result<String, ProviderError>> = text
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
