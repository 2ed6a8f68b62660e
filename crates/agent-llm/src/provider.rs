use std::pin::Pin;

use agent_core::tools::ToolSchema;
use agent_core::{AgentError, Message};
use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::LLMChunk;

#[derive(Error, Debug)]
pub enum LLMError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Cancelled")]
    Cancelled,
}

impl LLMError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LLMError::Cancelled)
    }
}

impl From<LLMError> for AgentError {
    fn from(error: LLMError) -> Self {
        match error {
            LLMError::Cancelled => AgentError::Cancelled,
            other => AgentError::LLM(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LLMError>;

pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMChunk>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Provider default when `None`.
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub tools: Vec<ToolSchema>,
    /// Providers may end the stream with `LLMError::Cancelled` once this fires.
    pub cancel_token: CancellationToken,
}

impl GenerationOptions {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            cancel_token,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: Option<u32>) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stream a response.
    ///
    /// # Arguments
    /// * `context` - Conversation or branch history the prompt belongs to
    /// * `prompt` - Text of the turn being answered
    /// * `options` - Model, limits, tools and the cancellation token
    async fn chat_stream(
        &self,
        context: &[Message],
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<LLMStream>;

    /// List available models
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }
}
