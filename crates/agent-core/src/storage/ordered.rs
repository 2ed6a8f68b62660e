use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::agent::Conversation;
use crate::storage::ConversationRepository;

/// Serializes writes per conversation and drops any snapshot whose revision
/// is older than the last one written. Every writer of a conversation must
/// share one instance; [`crate::ConversationStore::repository`] hands it out.
pub struct OrderedRepository {
    inner: Arc<dyn ConversationRepository>,
    written: DashMap<String, Arc<Mutex<Option<u64>>>>,
}

impl OrderedRepository {
    pub fn new(inner: Arc<dyn ConversationRepository>) -> Self {
        Self {
            inner,
            written: DashMap::new(),
        }
    }

    fn slot(&self, conversation_id: &str) -> Arc<Mutex<Option<u64>>> {
        Arc::clone(
            self.written
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        )
    }
}

#[async_trait]
impl ConversationRepository for OrderedRepository {
    async fn create_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        let slot = self.slot(&conversation.id);
        let mut written = slot.lock().await;
        self.inner.create_conversation(conversation).await?;
        *written = Some(conversation.revision);
        Ok(())
    }

    async fn update_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        let slot = self.slot(&conversation.id);
        let mut written = slot.lock().await;
        if let Some(last) = *written {
            if conversation.revision < last {
                log::debug!(
                    "[{}] Skipping stale snapshot r{} (r{} already written)",
                    conversation.id,
                    conversation.revision,
                    last
                );
                return Ok(());
            }
        }
        self.inner.update_conversation(conversation).await?;
        *written = Some(conversation.revision);
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> io::Result<Option<Conversation>> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> io::Result<bool> {
        let slot = self.slot(conversation_id);
        let _written = slot.lock().await;
        let deleted = self.inner.delete_conversation(conversation_id).await?;
        self.written.remove(conversation_id);
        Ok(deleted)
    }
}
