pub mod abort;
pub mod retry;
pub mod store;

use agent_core::{Conversation, ConversationRepository};

pub use abort::{AbortCoordinator, AbortResolution, CustomAbortHandler};
pub use retry::{AlternativeResponseGenerator, RetryConfig, RetryOutcome, RetryRejection};
pub use store::{BranchInfo, BranchStore};

/// Writes a snapshot taken with [`Conversation::snapshot`], logging instead
/// of failing. In-memory state stays authoritative when the repository is
/// unavailable. Pass the repository from
/// [`agent_core::ConversationStore::repository`] so these writes are ordered
/// with the store's own.
pub(crate) async fn persist_snapshot(
    repository: &dyn ConversationRepository,
    snapshot: &Conversation,
) -> bool {
    match repository.update_conversation(snapshot).await {
        Ok(()) => true,
        Err(error) => {
            log::warn!("[{}] Failed to persist conversation: {}", snapshot.id, error);
            false
        }
    }
}
