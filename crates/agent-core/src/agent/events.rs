use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::branch::SubagentState;
use crate::agent::types::Conversation;
use crate::tools::ToolCall;

/// Everything the renderer is told. The renderer never calls back into the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    StreamingUpdate {
        message_id: String,
        content: String,
        is_complete: bool,
        /// `content` is a delta when true, the full text otherwise.
        is_incremental: bool,
    },

    ConversationUpdated {
        conversation: Conversation,
    },

    ToolCallsDetected {
        message_id: String,
        tool_calls: Vec<ToolCall>,
    },

    LoadingStateChanged {
        is_loading: bool,
    },

    Error {
        message: String,
    },

    BranchCreated {
        conversation_id: String,
        message_id: String,
        branch_id: String,
    },

    BranchSwitched {
        conversation_id: String,
        message_id: String,
        index: usize,
    },

    SubagentStateChanged {
        subagent_id: String,
        branch_id: String,
        state: SubagentState,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChatEvent);

    fn streaming_update(&self, message_id: &str, content: &str, is_complete: bool, is_incremental: bool) {
        self.emit(ChatEvent::StreamingUpdate {
            message_id: message_id.to_string(),
            content: content.to_string(),
            is_complete,
            is_incremental,
        });
    }

    fn conversation_updated(&self, conversation: &Conversation) {
        self.emit(ChatEvent::ConversationUpdated {
            conversation: conversation.clone(),
        });
    }

    fn tool_calls_detected(&self, message_id: &str, tool_calls: &[ToolCall]) {
        self.emit(ChatEvent::ToolCallsDetected {
            message_id: message_id.to_string(),
            tool_calls: tool_calls.to_vec(),
        });
    }

    fn loading_state_changed(&self, is_loading: bool) {
        self.emit(ChatEvent::LoadingStateChanged { is_loading });
    }

    fn error(&self, message: &str) {
        self.emit(ChatEvent::Error {
            message: message.to_string(),
        });
    }
}

impl EventSink for mpsc::UnboundedSender<ChatEvent> {
    fn emit(&self, event: ChatEvent) {
        if self.send(event).is_err() {
            log::debug!("Event receiver dropped, discarding chat event");
        }
    }
}

/// Sink for callers that do not render anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ChatEvent) {}
}
