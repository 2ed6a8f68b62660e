use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::agent::error::Result;
use crate::agent::{AgentError, Branch, BranchKind, BranchMetadata, Conversation, Message, SubagentState};
use crate::storage::{BranchRepository, ConversationRepository, OrderedRepository};

/// A conversation that several tasks mutate in place. Write locks are only
/// held between suspension points, never across an await on a provider,
/// tool, or repository.
pub type SharedConversation = Arc<RwLock<Conversation>>;

/// Live conversations, shared between generators and subagents, written
/// through to a [`ConversationRepository`]. Writes go through an
/// [`OrderedRepository`]; other writers of the same conversations (retry
/// generator, abort coordinator, branch store) take theirs from
/// [`ConversationStore::repository`].
pub struct ConversationStore {
    repository: Arc<dyn ConversationRepository>,
    live: DashMap<String, SharedConversation>,
    branch_index: DashMap<String, String>,
}

impl ConversationStore {
    pub fn new(repository: Arc<dyn ConversationRepository>) -> Self {
        Self {
            repository: Arc::new(OrderedRepository::new(repository)),
            live: DashMap::new(),
            branch_index: DashMap::new(),
        }
    }

    pub fn repository(&self) -> Arc<dyn ConversationRepository> {
        Arc::clone(&self.repository)
    }

    pub async fn create(&self, conversation: Conversation) -> Result<SharedConversation> {
        self.repository.create_conversation(&conversation).await?;
        Ok(self.register(conversation))
    }

    /// Returns the live handle, loading it from the repository on first use.
    pub async fn open(&self, conversation_id: &str) -> Result<SharedConversation> {
        if let Some(shared) = self.live.get(conversation_id) {
            return Ok(Arc::clone(shared.value()));
        }

        let conversation = self
            .repository
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))?;

        // Another task may have opened it while we were loading.
        if let Some(shared) = self.live.get(conversation_id) {
            return Ok(Arc::clone(shared.value()));
        }
        Ok(self.register(conversation))
    }

    pub async fn persist(&self, conversation: &SharedConversation) -> Result<()> {
        let snapshot = conversation.write().await.snapshot();
        self.index_branches(&snapshot);
        self.repository.update_conversation(&snapshot).await?;
        Ok(())
    }

    pub async fn delete(&self, conversation_id: &str) -> Result<bool> {
        self.live.remove(conversation_id);
        self.branch_index
            .retain(|_, owner| owner.as_str() != conversation_id);
        Ok(self.repository.delete_conversation(conversation_id).await?)
    }

    pub fn is_open(&self, conversation_id: &str) -> bool {
        self.live.contains_key(conversation_id)
    }

    fn register(&self, conversation: Conversation) -> SharedConversation {
        self.index_branches(&conversation);
        let id = conversation.id.clone();
        let shared = Arc::new(RwLock::new(conversation));
        self.live.insert(id, Arc::clone(&shared));
        shared
    }

    fn index_branches(&self, conversation: &Conversation) {
        for branch_id in conversation.branch_ids() {
            self.branch_index.insert(branch_id, conversation.id.clone());
        }
    }

    async fn owner_of(&self, branch_id: &str) -> Result<SharedConversation> {
        let indexed = self
            .branch_index
            .get(branch_id)
            .map(|owner| owner.value().clone());
        if let Some(conversation_id) = indexed {
            return self.open(&conversation_id).await;
        }

        // Branches created elsewhere and not yet indexed.
        let candidates: Vec<SharedConversation> = self
            .live
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for candidate in candidates {
            let conversation = candidate.read().await;
            if conversation.find_branch(branch_id).is_some() {
                self.branch_index
                    .insert(branch_id.to_string(), conversation.id.clone());
                drop(conversation);
                return Ok(candidate);
            }
        }

        Err(AgentError::BranchNotFound(branch_id.to_string()))
    }

    /// Applies `mutate` to the branch under the write lock, then persists.
    async fn mutate_branch<F>(&self, branch_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Branch) -> Result<()> + Send,
    {
        let shared = self.owner_of(branch_id).await?;
        {
            let mut conversation = shared.write().await;
            let branch = conversation
                .find_branch_mut(branch_id)
                .ok_or_else(|| AgentError::BranchNotFound(branch_id.to_string()))?;
            mutate(branch)?;
            conversation.touch();
        }
        self.persist(&shared).await
    }
}

#[async_trait]
impl BranchRepository for ConversationStore {
    async fn create_subagent_branch(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        messages: Vec<Message>,
        metadata: BranchMetadata,
    ) -> Result<Branch> {
        let shared = self.open(conversation_id).await?;
        let branch = {
            let mut conversation = shared.write().await;
            let parent = conversation
                .message_mut(parent_message_id)
                .ok_or_else(|| AgentError::MessageNotFound(parent_message_id.to_string()))?;

            let mut branch = Branch::new(BranchKind::Subagent).with_metadata(metadata);
            for message in messages {
                branch.push_message(message);
            }
            parent.branches.push(branch.clone());
            parent.touch();
            conversation.touch();
            branch
        };

        self.branch_index
            .insert(branch.id.clone(), conversation_id.to_string());
        self.persist(&shared).await?;
        log::info!(
            "[{}] Created subagent branch {} under message {}",
            conversation_id,
            branch.id,
            parent_message_id
        );
        Ok(branch)
    }

    async fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>> {
        let shared = match self.owner_of(branch_id).await {
            Ok(shared) => shared,
            Err(AgentError::BranchNotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        let conversation = shared.read().await;
        Ok(conversation.find_branch(branch_id).cloned())
    }

    async fn add_message_to_branch(&self, branch_id: &str, message: Message) -> Result<()> {
        self.mutate_branch(branch_id, move |branch| {
            branch.push_message(message);
            Ok(())
        })
        .await
    }

    async fn update_message_in_branch(&self, branch_id: &str, message: &Message) -> Result<()> {
        let mut replacement = message.clone();
        replacement.conversation_id = branch_id.to_string();
        self.mutate_branch(branch_id, move |branch| {
            let existing = branch
                .message_mut(&replacement.id)
                .ok_or_else(|| AgentError::MessageNotFound(replacement.id.clone()))?;
            *existing = replacement;
            branch.touch();
            Ok(())
        })
        .await
    }

    async fn update_branch_state(&self, branch_id: &str, state: SubagentState) -> Result<()> {
        self.mutate_branch(branch_id, move |branch| {
            branch.set_state(state);
            Ok(())
        })
        .await
    }

    async fn update_branch_metadata(&self, branch_id: &str, metadata: BranchMetadata) -> Result<()> {
        self.mutate_branch(branch_id, move |branch| {
            branch.metadata = metadata;
            branch.touch();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryRepository;

    async fn store_with_parent() -> (ConversationStore, Arc<MemoryRepository>, String) {
        let repository = Arc::new(MemoryRepository::new());
        let store = ConversationStore::new(repository.clone());
        let mut conversation = Conversation::new("conv-1");
        conversation.add_message(Message::user("research this"));
        let parent_id = conversation.add_message(Message::assistant("delegating", None));
        store.create(conversation).await.expect("create");
        (store, repository, parent_id)
    }

    #[tokio::test]
    async fn subagent_branch_messages_carry_branch_id() {
        let (store, repository, parent_id) = store_with_parent().await;

        let branch = store
            .create_subagent_branch(
                "conv-1",
                &parent_id,
                vec![Message::system("You are a researcher."), Message::user("find docs")],
                BranchMetadata::for_task("find docs"),
            )
            .await
            .expect("branch");
        store
            .add_message_to_branch(&branch.id, Message::assistant("found", None))
            .await
            .expect("add");

        let stored = store.get_branch(&branch.id).await.unwrap().expect("branch exists");
        assert_eq!(stored.messages.len(), 3);
        assert!(stored
            .messages
            .iter()
            .all(|message| message.conversation_id == branch.id));

        let persisted = repository.stored("conv-1").await.expect("persisted");
        let parent = persisted.message(&parent_id).expect("parent");
        assert_eq!(parent.branches[0].messages.len(), 3);
    }

    #[tokio::test]
    async fn branch_updates_are_visible_through_the_live_handle() {
        let (store, _repository, parent_id) = store_with_parent().await;
        let branch = store
            .create_subagent_branch("conv-1", &parent_id, Vec::new(), BranchMetadata::default())
            .await
            .unwrap();

        store
            .update_branch_state(&branch.id, SubagentState::Complete)
            .await
            .unwrap();

        let shared = store.open("conv-1").await.unwrap();
        let conversation = shared.read().await;
        let live = conversation.find_branch(&branch.id).unwrap();
        assert_eq!(live.state(), Some(SubagentState::Complete));
    }

    #[tokio::test]
    async fn unknown_branch_is_reported() {
        let (store, _repository, _parent_id) = store_with_parent().await;

        assert!(store.get_branch("missing").await.unwrap().is_none());
        let error = store
            .update_branch_state("missing", SubagentState::Cancelled)
            .await
            .expect_err("missing branch");
        assert!(matches!(error, AgentError::BranchNotFound(_)));
    }

    #[tokio::test]
    async fn update_message_in_branch_replaces_by_id() {
        let (store, _repository, parent_id) = store_with_parent().await;
        let branch = store
            .create_subagent_branch("conv-1", &parent_id, Vec::new(), BranchMetadata::default())
            .await
            .unwrap();
        let mut draft = Message::assistant_draft();
        store.add_message_to_branch(&branch.id, draft.clone()).await.unwrap();

        draft.content = "done".to_string();
        draft.is_loading = false;
        store.update_message_in_branch(&branch.id, &draft).await.unwrap();

        let stored = store.get_branch(&branch.id).await.unwrap().unwrap();
        assert_eq!(stored.messages[0].content, "done");
        assert!(!stored.messages[0].is_loading);
    }

    #[tokio::test]
    async fn concurrent_branch_writes_persist_latest_state() {
        let memory = Arc::new(MemoryRepository::new());
        let store = Arc::new(ConversationStore::new(memory.clone()));
        let mut conversation = Conversation::new("conv-1");
        conversation.add_message(Message::user("research"));
        let parent_id = conversation.add_message(Message::assistant("delegating", None));
        store.create(conversation).await.unwrap();

        let first = store
            .create_subagent_branch("conv-1", &parent_id, Vec::new(), BranchMetadata::default())
            .await
            .unwrap();
        let second = store
            .create_subagent_branch("conv-1", &parent_id, Vec::new(), BranchMetadata::default())
            .await
            .unwrap();

        memory.delay_next_write(Duration::from_millis(100));
        let writer = Arc::clone(&store);
        let first_id = first.id.clone();
        let slow = tokio::spawn(async move {
            writer
                .add_message_to_branch(&first_id, Message::assistant("partial", None))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .update_branch_state(&second.id, SubagentState::Complete)
            .await
            .unwrap();
        slow.await.unwrap().unwrap();

        let persisted = memory.stored("conv-1").await.unwrap();
        assert_eq!(
            persisted.find_branch(&second.id).unwrap().state(),
            Some(SubagentState::Complete)
        );
        assert_eq!(persisted.find_branch(&first.id).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn open_loads_from_repository_once() {
        let repository = Arc::new(MemoryRepository::new());
        repository
            .update_conversation(&Conversation::new("conv-9"))
            .await
            .unwrap();
        let store = ConversationStore::new(repository);

        let first = store.open("conv-9").await.unwrap();
        let second = store.open("conv-9").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(
            store.open("nope").await,
            Err(AgentError::ConversationNotFound(_))
        ));
    }
}
