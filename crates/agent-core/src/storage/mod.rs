pub mod jsonl;
pub mod memory;
pub mod ordered;

use std::io;

use async_trait::async_trait;

use crate::agent::error::Result;
use crate::agent::{Branch, BranchMetadata, Conversation, Message, SubagentState};

pub use jsonl::JsonlStorage;
pub use memory::MemoryRepository;
pub use ordered::OrderedRepository;

/// Persistence for whole conversations. Implementations may fail at any call;
/// callers finalizing after an error treat these failures as best-effort.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> io::Result<()>;
    async fn update_conversation(&self, conversation: &Conversation) -> io::Result<()>;
    async fn get_conversation(&self, conversation_id: &str) -> io::Result<Option<Conversation>>;
    async fn delete_conversation(&self, conversation_id: &str) -> io::Result<bool>;
}

/// Branch-level access used by subagents, which treat a branch as its own
/// message stream.
#[async_trait]
pub trait BranchRepository: Send + Sync {
    async fn create_subagent_branch(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        messages: Vec<Message>,
        metadata: BranchMetadata,
    ) -> Result<Branch>;

    async fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>>;

    async fn add_message_to_branch(&self, branch_id: &str, message: Message) -> Result<()>;

    /// Replaces the branch message with the same id.
    async fn update_message_in_branch(&self, branch_id: &str, message: &Message) -> Result<()>;

    async fn update_branch_state(&self, branch_id: &str, state: SubagentState) -> Result<()>;

    async fn update_branch_metadata(&self, branch_id: &str, metadata: BranchMetadata) -> Result<()>;
}

/// Copy of `conversation` fit for writing: invalid messages never reach disk.
pub(crate) fn persistable(conversation: &Conversation) -> Conversation {
    let mut snapshot = conversation.clone();
    snapshot
        .messages
        .retain(|message| message.state != crate::agent::MessageState::Invalid);
    snapshot
}
