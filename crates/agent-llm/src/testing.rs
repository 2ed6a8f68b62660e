//! Deterministic provider for exercising generators without a backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_core::tools::ToolCall;
use agent_core::Message;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::provider::{GenerationOptions, LLMError, LLMProvider, LLMStream, Result};
use crate::types::LLMChunk;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(LLMChunk),
    /// Ends the stream with `LLMError::Stream`.
    Fail(String),
    /// Blocks the stream until the gate is notified.
    WaitFor(Arc<Notify>),
}

impl ScriptStep {
    pub fn token(text: impl Into<String>) -> Self {
        ScriptStep::Chunk(LLMChunk::Token(text.into()))
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        ScriptStep::Chunk(LLMChunk::Reasoning(text.into()))
    }

    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        ScriptStep::Chunk(LLMChunk::ToolCalls(vec![ToolCall::new(id, name, arguments)]))
    }

    pub fn done() -> Self {
        ScriptStep::Chunk(LLMChunk::Done)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub context: Vec<Message>,
    pub prompt: String,
    pub model: Option<String>,
}

/// Replays one script per `chat_stream` call. Once the queue is empty the
/// repeating script (if any) is used for every further call.
#[derive(Default)]
pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<Vec<ScriptStep>>>,
    repeating: Option<Vec<ScriptStep>>,
    request_error: Option<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            ..Default::default()
        }
    }

    /// A single round streaming `text` as one token.
    pub fn text(text: &str) -> Self {
        Self::new(vec![vec![ScriptStep::token(text), ScriptStep::done()]])
    }

    pub fn repeating(mut self, steps: Vec<ScriptStep>) -> Self {
        self.repeating = Some(steps);
        self
    }

    /// Every request fails before a stream is produced.
    pub fn failing_requests(mut self, message: impl Into<String>) -> Self {
        self.request_error = Some(message.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        context: &[Message],
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<LLMStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(RecordedRequest {
            context: context.to_vec(),
            prompt: prompt.to_string(),
            model: options.model.clone(),
        });

        if let Some(message) = &self.request_error {
            return Err(LLMError::Api(message.clone()));
        }

        let steps = match self.rounds.lock().await.pop_front() {
            Some(steps) => steps,
            None => self
                .repeating
                .clone()
                .ok_or_else(|| LLMError::Api("script exhausted".to_string()))?,
        };

        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    ScriptStep::Chunk(chunk) => {
                        yield Ok(chunk);
                    }
                    ScriptStep::Fail(message) => {
                        yield Err(LLMError::Stream(message));
                        break;
                    }
                    ScriptStep::WaitFor(gate) => gate.notified().await,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn rounds_are_replayed_in_order_then_repeat() {
        let provider = ScriptedProvider::new(vec![vec![ScriptStep::token("first")]])
            .repeating(vec![ScriptStep::token("again")]);
        let options = GenerationOptions::default();

        let mut first = provider.chat_stream(&[], "a", &options).await.unwrap();
        assert_eq!(
            first.next().await.unwrap().unwrap(),
            LLMChunk::Token("first".to_string())
        );

        for _ in 0..2 {
            let mut next = provider.chat_stream(&[], "b", &options).await.unwrap();
            assert_eq!(
                next.next().await.unwrap().unwrap(),
                LLMChunk::Token("again".to_string())
            );
        }

        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests().await[1].prompt, "b");
    }

    #[tokio::test]
    async fn exhausted_script_fails_the_request() {
        let provider = ScriptedProvider::new(Vec::new());
        let result = provider
            .chat_stream(&[], "hi", &GenerationOptions::default())
            .await;
        assert!(matches!(result, Err(LLMError::Api(_))));
    }

    #[tokio::test]
    async fn fail_step_ends_the_stream() {
        let provider = ScriptedProvider::new(vec![vec![
            ScriptStep::Fail("boom".to_string()),
            ScriptStep::token("unreachable"),
        ]]);
        let mut stream = provider
            .chat_stream(&[], "hi", &GenerationOptions::default())
            .await
            .unwrap();

        assert!(matches!(stream.next().await, Some(Err(LLMError::Stream(_)))));
        assert!(stream.next().await.is_none());
    }
}
