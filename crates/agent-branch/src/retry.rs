use std::sync::Arc;

use agent_core::config::DEFAULT_RETRY_FAILURE_MESSAGE;
use agent_core::{
    filter_completed_tool_calls, AgentError, Branch, BranchKind, BranchMetadata, ChatEvent,
    ConversationRepository, EngineConfig, EventSink, Message, MessageState, Role,
    SharedConversation, ToolCallAccumulator, ToolSchema,
};
use agent_llm::{CancellableStream, GenerationOptions, LLMChunk, LLMProvider};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::persist_snapshot;

type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Shown to the user when a retry fails; the underlying error is only logged.
    pub failure_message: String,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub tools: Vec<ToolSchema>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            failure_message: DEFAULT_RETRY_FAILURE_MESSAGE.to_string(),
            model: None,
            max_output_tokens: None,
            tools: Vec::new(),
        }
    }
}

impl From<&EngineConfig> for RetryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            failure_message: config.retry_failure_message.clone(),
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRejection {
    MessageNotFound,
    NotAssistant,
    NoPrecedingUserMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Completed { branch_id: String },
    Cancelled { branch_id: String, kept_partial: bool },
    Failed { branch_id: String },
    AlreadyInFlight,
    Rejected(RetryRejection),
}

/// Removes the in-flight entry for a message however the retry ends.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, CancellationToken>,
    message_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.message_id);
    }
}

struct PreparedRetry {
    branch_id: String,
    context: Vec<Message>,
    prompt: String,
}

/// Regenerates an assistant message in place, keeping the previous answer
/// as a branch.
pub struct AlternativeResponseGenerator {
    llm: Arc<dyn LLMProvider>,
    repository: Arc<dyn ConversationRepository>,
    sink: Arc<dyn EventSink>,
    config: RetryConfig,
    in_flight: DashMap<String, CancellationToken>,
}

impl AlternativeResponseGenerator {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        repository: Arc<dyn ConversationRepository>,
        sink: Arc<dyn EventSink>,
        config: RetryConfig,
    ) -> Self {
        Self {
            llm,
            repository,
            sink,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn is_retrying(&self, message_id: &str) -> bool {
        self.in_flight.contains_key(message_id)
    }

    /// Cancels the retry for `message_id`, if any.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.in_flight.get(message_id) {
            Some(token) => {
                token.cancel();
                log::info!("[{}] Retry cancellation requested", message_id);
                true
            }
            None => false,
        }
    }

    pub async fn retry(&self, conversation: &SharedConversation, message_id: &str) -> RetryOutcome {
        let cancel_token = match self.in_flight.entry(message_id.to_string()) {
            Entry::Occupied(_) => {
                log::debug!("[{}] Retry already in flight", message_id);
                return RetryOutcome::AlreadyInFlight;
            }
            Entry::Vacant(entry) => entry.insert(CancellationToken::new()).clone(),
        };
        let guard = InFlightGuard {
            in_flight: &self.in_flight,
            message_id: message_id.to_string(),
        };

        let prepared = match self.branch_and_clear(conversation, message_id).await {
            Ok(prepared) => prepared,
            Err(rejection) => {
                log::debug!("[{}] Retry rejected: {:?}", message_id, rejection);
                return RetryOutcome::Rejected(rejection);
            }
        };

        self.sink.loading_state_changed(true);
        let result = self
            .stream_into_message(conversation, message_id, &prepared, &cancel_token)
            .await;

        let branch_id = prepared.branch_id;
        let outcome = match result {
            Ok(()) => {
                self.finish_success(conversation, message_id).await;
                RetryOutcome::Completed { branch_id }
            }
            Err(error) if error.is_cancellation() => {
                let kept_partial = self.finish_cancelled(conversation, message_id).await;
                RetryOutcome::Cancelled {
                    branch_id,
                    kept_partial,
                }
            }
            Err(error) => {
                log::error!("[{}] Retry failed: {}", message_id, error);
                self.finish_error(conversation, message_id).await;
                RetryOutcome::Failed { branch_id }
            }
        };

        drop(guard);
        self.sink.loading_state_changed(false);
        outcome
    }

    /// Moves the current answer into a new branch, then resets the live
    /// message for streaming.
    async fn branch_and_clear(
        &self,
        conversation: &SharedConversation,
        message_id: &str,
    ) -> std::result::Result<PreparedRetry, RetryRejection> {
        let (branched, cleared, prepared) = {
            let mut conversation = conversation.write().await;
            let index = conversation
                .position(message_id)
                .ok_or(RetryRejection::MessageNotFound)?;
            if conversation.messages[index].role != Role::Assistant {
                return Err(RetryRejection::NotAssistant);
            }
            let prompt = conversation
                .preceding_user_message(index)
                .map(|message| message.content.clone())
                .ok_or(RetryRejection::NoPrecedingUserMessage)?;
            let context = conversation.messages[..index].to_vec();

            let continuation: Vec<Message> = if conversation.messages[index].tool_calls.is_some() {
                let end = conversation.messages[index + 1..]
                    .iter()
                    .position(|message| matches!(message.role, Role::User | Role::System))
                    .map(|offset| index + 1 + offset)
                    .unwrap_or(conversation.messages.len());
                conversation.messages.drain(index + 1..end).collect()
            } else {
                Vec::new()
            };

            let message = &mut conversation.messages[index];
            let mut previous = Message::assistant(message.content.clone(), message.tool_calls.clone());
            previous.reasoning = message.reasoning.clone();
            previous.state = message.state;

            let mut branch = Branch::new(BranchKind::HumanRetry).with_metadata(
                BranchMetadata::default().with_extra("source_message_id", message_id),
            );
            branch.push_message(previous);
            for moved in continuation {
                branch.push_message(moved);
            }
            let branch_id = branch.id.clone();
            message.branches.push(branch);
            message.touch();
            conversation.touch();
            let branched = conversation.snapshot();

            let message = &mut conversation.messages[index];
            message.content.clear();
            message.tool_calls = None;
            message.reasoning = None;
            message.is_loading = true;
            message.state = MessageState::Draft;
            message.active_alternative_index = 0;
            message.touch();
            let cleared = conversation.clone();

            (
                branched,
                cleared,
                PreparedRetry {
                    branch_id,
                    context,
                    prompt,
                },
            )
        };

        log::info!(
            "[{}] Saved previous answer to branch {}",
            message_id,
            prepared.branch_id
        );
        persist_snapshot(self.repository.as_ref(), &branched).await;
        self.sink.emit(ChatEvent::BranchCreated {
            conversation_id: cleared.id.clone(),
            message_id: message_id.to_string(),
            branch_id: prepared.branch_id.clone(),
        });
        self.sink.conversation_updated(&cleared);
        Ok(prepared)
    }

    async fn stream_into_message(
        &self,
        conversation: &SharedConversation,
        message_id: &str,
        prepared: &PreparedRetry,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        if cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let options = GenerationOptions::new(cancel_token.clone())
            .with_model(self.config.model.clone())
            .with_max_output_tokens(self.config.max_output_tokens)
            .with_tools(self.config.tools.clone());
        let stream = self
            .llm
            .chat_stream(&prepared.context, &prepared.prompt, &options)
            .await?;
        if cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut reader = CancellableStream::new(stream, cancel_token.clone());
        let mut tool_calls = ToolCallAccumulator::new();

        while let Some(chunk) = reader.next_chunk().await {
            match chunk? {
                LLMChunk::Token(token) => {
                    update_message(conversation, message_id, |message| {
                        message.content.push_str(&token);
                        message.state = MessageState::Streaming;
                    })
                    .await?;
                    self.sink.streaming_update(message_id, &token, false, true);
                }
                LLMChunk::Reasoning(text) => {
                    update_message(conversation, message_id, |message| {
                        message
                            .reasoning
                            .get_or_insert_with(String::new)
                            .push_str(&text);
                    })
                    .await?;
                }
                LLMChunk::ToolCalls(parts) => {
                    log::debug!("[{}] Received {} tool call parts", message_id, parts.len());
                    tool_calls.extend(parts);
                    let current = tool_calls.snapshot();
                    update_message(conversation, message_id, |message| {
                        message.tool_calls = Some(current.clone());
                    })
                    .await?;
                    self.sink.tool_calls_detected(message_id, &current);
                }
                LLMChunk::Done => {
                    log::debug!("[{}] Retry stream completed", message_id);
                    break;
                }
            }
        }

        if !tool_calls.is_empty() {
            let finalized = tool_calls.finalize();
            update_message(conversation, message_id, |message| {
                message.tool_calls = (!finalized.is_empty()).then_some(finalized);
            })
            .await?;
        }
        Ok(())
    }

    async fn finish_success(&self, conversation: &SharedConversation, message_id: &str) {
        let finalized = finalize_message(conversation, message_id, |message| {
            message.state = MessageState::Complete;
            message.is_loading = false;
        })
        .await;
        let Some((snapshot, content)) = finalized else {
            return;
        };

        persist_snapshot(self.repository.as_ref(), &snapshot).await;
        self.sink.streaming_update(message_id, &content, true, false);
        self.sink.conversation_updated(&snapshot);
        log::info!("[{}] Retry completed", message_id);
    }

    /// Returns whether partial content was kept. The message itself always
    /// stays.
    async fn finish_cancelled(&self, conversation: &SharedConversation, message_id: &str) -> bool {
        let finalized = finalize_message(conversation, message_id, |message| {
            message.is_loading = false;
            message.state = MessageState::Aborted;
            if message.has_content() {
                message.tool_calls = filter_completed_tool_calls(message.tool_calls.as_deref());
            } else {
                message.content.clear();
                message.tool_calls = None;
            }
        })
        .await;
        let Some((snapshot, content)) = finalized else {
            return false;
        };

        let kept_partial = !content.is_empty();
        persist_snapshot(self.repository.as_ref(), &snapshot).await;
        if kept_partial {
            self.sink.streaming_update(message_id, &content, true, false);
        }
        self.sink.conversation_updated(&snapshot);
        log::info!(
            "[{}] Retry cancelled (partial kept: {})",
            message_id,
            kept_partial
        );
        kept_partial
    }

    async fn finish_error(&self, conversation: &SharedConversation, message_id: &str) {
        let finalized = finalize_message(conversation, message_id, |message| {
            message.is_loading = false;
            message.state = MessageState::Error;
        })
        .await;
        if let Some((snapshot, _)) = finalized {
            persist_snapshot(self.repository.as_ref(), &snapshot).await;
            self.sink.conversation_updated(&snapshot);
        }
        self.sink.error(&self.config.failure_message);
    }
}

async fn update_message<F>(conversation: &SharedConversation, message_id: &str, update: F) -> Result<()>
where
    F: FnOnce(&mut Message),
{
    let mut conversation = conversation.write().await;
    let message = conversation
        .message_mut(message_id)
        .ok_or_else(|| AgentError::MessageNotFound(message_id.to_string()))?;
    update(message);
    message.touch();
    Ok(())
}

/// Applies the final update and returns the conversation snapshot together
/// with the message's final content.
async fn finalize_message<F>(
    conversation: &SharedConversation,
    message_id: &str,
    update: F,
) -> Option<(agent_core::Conversation, String)>
where
    F: FnOnce(&mut Message),
{
    let mut conversation = conversation.write().await;
    let message = match conversation.message_mut(message_id) {
        Some(message) => message,
        None => {
            log::warn!("[{}] Message disappeared before the retry finished", message_id);
            return None;
        }
    };
    update(message);
    message.touch();
    let content = message.content.clone();
    conversation.touch();
    Some((conversation.snapshot(), content))
}
