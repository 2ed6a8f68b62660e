use tokio_util::sync::CancellationToken;

use agent_core::tools::{ToolCall, ToolCallAccumulator};
use agent_core::{AgentError, EventSink};
use agent_llm::{CancellableStream, LLMChunk, LLMStream};

/// What a stream produced so far. Survives an interrupted stream so the
/// caller can decide what to keep.
#[derive(Debug, Default)]
pub struct StreamHandlingOutput {
    pub content: String,
    pub reasoning: String,
    pub token_count: usize,
    pub tool_calls: ToolCallAccumulator,
}

impl StreamHandlingOutput {
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    pub fn reasoning(&self) -> Option<String> {
        (!self.reasoning.is_empty()).then(|| self.reasoning.clone())
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls.snapshot()
    }
}

pub async fn consume_llm_stream(
    stream: LLMStream,
    output: &mut StreamHandlingOutput,
    sink: &dyn EventSink,
    cancel_token: &CancellationToken,
    message_id: &str,
) -> Result<(), AgentError> {
    let mut reader = CancellableStream::new(stream, cancel_token.clone());

    while let Some(chunk) = reader.next_chunk().await {
        match chunk? {
            LLMChunk::Token(token) => {
                output.token_count += token.len();
                output.content.push_str(&token);
                sink.streaming_update(message_id, &token, false, true);
            }
            LLMChunk::Reasoning(text) => {
                output.reasoning.push_str(&text);
            }
            LLMChunk::ToolCalls(partial_calls) => {
                log::debug!(
                    "[{}] Received {} tool call parts",
                    message_id,
                    partial_calls.len()
                );
                output.tool_calls.extend(partial_calls);
                sink.tool_calls_detected(message_id, &output.tool_calls.snapshot());
            }
            LLMChunk::Done => {
                log::debug!("[{}] LLM stream completed", message_id);
                break;
            }
        }
    }

    Ok(())
}
