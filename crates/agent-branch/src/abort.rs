use std::sync::Arc;

use agent_core::{
    filter_completed_tool_calls, AgentError, ConversationRepository, EventSink, Message,
    MessageState, SharedConversation,
};

use crate::persist_snapshot;

/// Replaces the default abort policy. Called with whether the message had
/// visible content, and the message itself.
pub type CustomAbortHandler = Box<dyn FnOnce(bool, &mut Message) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResolution {
    /// Partial content was kept and the message marked aborted.
    KeptPartial,
    /// Nothing worth keeping; the message was dropped.
    Removed,
    /// A custom handler took over.
    Delegated,
    NotFound,
}

/// Decides what happens to a message whose generation was cancelled.
pub struct AbortCoordinator {
    repository: Arc<dyn ConversationRepository>,
    sink: Arc<dyn EventSink>,
}

impl AbortCoordinator {
    pub fn new(repository: Arc<dyn ConversationRepository>, sink: Arc<dyn EventSink>) -> Self {
        Self { repository, sink }
    }

    pub async fn handle_abort(
        &self,
        conversation: &SharedConversation,
        message_id: Option<&str>,
        custom_handler: Option<CustomAbortHandler>,
    ) -> AbortResolution {
        let Some(message_id) = message_id else {
            return AbortResolution::NotFound;
        };

        let (resolution, snapshot, final_content) = {
            let mut conversation = conversation.write().await;
            let Some(message) = conversation.message_mut(message_id) else {
                log::debug!("[{}] Abort for unknown message ignored", message_id);
                return AbortResolution::NotFound;
            };
            let has_content = message.has_content();

            if let Some(handler) = custom_handler {
                handler(has_content, message);
                return AbortResolution::Delegated;
            }

            if has_content {
                message.tool_calls = filter_completed_tool_calls(message.tool_calls.as_deref());
                message.state = MessageState::Aborted;
                message.is_loading = false;
                message.touch();
                let content = message.content.clone();
                conversation.touch();
                (AbortResolution::KeptPartial, conversation.snapshot(), Some(content))
            } else {
                message.state = MessageState::Invalid;
                conversation.remove_message(message_id);
                (AbortResolution::Removed, conversation.snapshot(), None)
            }
        };

        log::info!("[{}] Abort resolved as {:?}", message_id, resolution);
        persist_snapshot(self.repository.as_ref(), &snapshot).await;
        if let Some(content) = final_content {
            self.sink.streaming_update(message_id, &content, true, false);
        }
        self.sink.conversation_updated(&snapshot);
        resolution
    }

    /// Applies the abort policy only when `error` is a cancellation. Returns
    /// whether it did.
    pub async fn handle_abort_error(
        &self,
        error: &AgentError,
        conversation: &SharedConversation,
        message_id: Option<&str>,
        custom_handler: Option<CustomAbortHandler>,
    ) -> bool {
        if !error.is_cancellation() {
            return false;
        }
        self.handle_abort(conversation, message_id, custom_handler)
            .await;
        true
    }
}
