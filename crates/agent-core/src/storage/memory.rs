use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::agent::Conversation;
use crate::storage::{persistable, ConversationRepository};

/// Conversation repository kept in process memory. Writes can be made to
/// fail or stall on demand, which is how error paths and write races are
/// exercised.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    conversations: RwLock<HashMap<String, Conversation>>,
    fail_writes: AtomicBool,
    next_write_delay_ms: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The next create/update sleeps for `delay` before storing.
    pub fn delay_next_write(&self, delay: Duration) {
        self.next_write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Successful create/update calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    async fn write(&self, conversation: &Conversation) -> io::Result<()> {
        let delay = self.next_write_delay_ms.swap(0, Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("repository unavailable"));
        }
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), persistable(conversation));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for MemoryRepository {
    async fn create_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        if self.conversations.read().await.contains_key(&conversation.id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("conversation {} already exists", conversation.id),
            ));
        }
        self.write(conversation).await
    }

    async fn update_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        self.write(conversation).await
    }

    async fn get_conversation(&self, conversation_id: &str) -> io::Result<Option<Conversation>> {
        Ok(self.stored(conversation_id).await)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> io::Result<bool> {
        Ok(self
            .conversations
            .write()
            .await
            .remove(conversation_id)
            .is_some())
    }
}
