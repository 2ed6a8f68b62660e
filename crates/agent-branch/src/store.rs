use std::sync::Arc;

use agent_core::{
    Branch, BranchKind, ChatEvent, ConversationRepository, EventSink, Message,
    SharedConversation, ToolCall,
};

use crate::persist_snapshot;

/// Position of a message among its alternatives, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    /// 1-based; 1 is the message's own content.
    pub current: usize,
    pub total: usize,
    pub has_branches: bool,
    pub active_branch_id: Option<String>,
}

/// Resolves and switches between a message's alternatives.
pub struct BranchStore {
    repository: Arc<dyn ConversationRepository>,
    sink: Arc<dyn EventSink>,
}

impl BranchStore {
    pub fn new(repository: Arc<dyn ConversationRepository>, sink: Arc<dyn EventSink>) -> Self {
        Self { repository, sink }
    }

    /// Active index with out-of-range values read as 0.
    fn effective_index(message: &Message) -> usize {
        if message.active_alternative_index > message.branches.len() {
            0
        } else {
            message.active_alternative_index
        }
    }

    pub fn active_branch(message: &Message) -> Option<&Branch> {
        match Self::effective_index(message) {
            0 => None,
            index => message.branches.get(index - 1),
        }
    }

    pub fn active_content(message: &Message) -> &str {
        match Self::active_branch(message) {
            None => &message.content,
            Some(branch) => branch
                .first_message()
                .map(|first| first.content.as_str())
                .unwrap_or(""),
        }
    }

    pub fn active_tool_calls(message: &Message) -> Option<&[ToolCall]> {
        let calls = match Self::active_branch(message) {
            None => message.tool_calls.as_deref(),
            Some(branch) => branch.first_message()?.tool_calls.as_deref(),
        };
        calls.filter(|calls| !calls.is_empty())
    }

    pub fn active_reasoning(message: &Message) -> Option<&str> {
        match Self::active_branch(message) {
            None => message.reasoning.as_deref(),
            Some(branch) => branch.first_message()?.reasoning.as_deref(),
        }
    }

    pub fn branch_info(message: &Message) -> BranchInfo {
        let index = Self::effective_index(message);
        BranchInfo {
            current: index + 1,
            total: message.branches.len() + 1,
            has_branches: !message.branches.is_empty(),
            active_branch_id: Self::active_branch(message).map(|branch| branch.id.clone()),
        }
    }

    pub fn previous_index(message: &Message) -> Option<usize> {
        Self::effective_index(message).checked_sub(1)
    }

    pub fn next_index(message: &Message) -> Option<usize> {
        let index = Self::effective_index(message);
        (index < message.branches.len()).then_some(index + 1)
    }

    /// Adds a branch holding `alternative` and makes it active. `None` when the
    /// message does not exist.
    pub async fn create_human_branch(
        &self,
        conversation: &SharedConversation,
        message_id: &str,
        alternative: Message,
    ) -> Option<String> {
        let (snapshot, branch_id) = {
            let mut conversation = conversation.write().await;
            let message = conversation.message_mut(message_id)?;

            let mut branch = Branch::new(BranchKind::HumanRetry);
            branch.push_message(alternative);
            let branch_id = branch.id.clone();
            message.branches.push(branch);
            message.active_alternative_index = message.branches.len();
            message.touch();
            conversation.touch();
            (conversation.snapshot(), branch_id)
        };

        log::info!(
            "[{}] Created branch {} for message {}",
            snapshot.id,
            branch_id,
            message_id
        );
        persist_snapshot(self.repository.as_ref(), &snapshot).await;
        self.sink.emit(ChatEvent::BranchCreated {
            conversation_id: snapshot.id.clone(),
            message_id: message_id.to_string(),
            branch_id: branch_id.clone(),
        });
        self.sink.conversation_updated(&snapshot);
        Some(branch_id)
    }

    /// `index` 0 selects the message's own content, k selects branch k-1.
    pub async fn switch_to_branch_by_index(
        &self,
        conversation: &SharedConversation,
        message_id: &str,
        index: usize,
    ) -> bool {
        let snapshot = {
            let mut conversation = conversation.write().await;
            let Some(message) = conversation.message_mut(message_id) else {
                return false;
            };
            if message.branches.is_empty() || index > message.branches.len() {
                log::debug!(
                    "[{}] Rejected switch to alternative {} of {}",
                    message_id,
                    index,
                    message.branches.len()
                );
                return false;
            }
            message.active_alternative_index = index;
            message.touch();
            conversation.touch();
            conversation.snapshot()
        };

        persist_snapshot(self.repository.as_ref(), &snapshot).await;
        self.sink.emit(ChatEvent::BranchSwitched {
            conversation_id: snapshot.id.clone(),
            message_id: message_id.to_string(),
            index,
        });
        self.sink.conversation_updated(&snapshot);
        true
    }

    pub async fn switch_to_branch(
        &self,
        conversation: &SharedConversation,
        message_id: &str,
        branch_id: &str,
    ) -> bool {
        let index = {
            let conversation = conversation.read().await;
            conversation.message(message_id).and_then(|message| {
                message
                    .branches
                    .iter()
                    .position(|branch| branch.id == branch_id)
            })
        };
        match index {
            Some(position) => {
                self.switch_to_branch_by_index(conversation, message_id, position + 1)
                    .await
            }
            None => false,
        }
    }
}
