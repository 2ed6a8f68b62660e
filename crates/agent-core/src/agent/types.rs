use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::branch::Branch;
use crate::tools::ToolCall;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Lifecycle of a single message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    #[default]
    Draft,
    Streaming,
    Complete,
    Aborted,
    Error,
    /// Never persisted; an invalid message is dropped from its conversation.
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "generate_id")]
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub state: MessageState,
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    /// 0 shows the message itself, k >= 1 shows `branches[k - 1]`.
    #[serde(default)]
    pub active_alternative_index: usize,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            conversation_id: String::new(),
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
            state: MessageState::Complete,
            is_loading: false,
            branches: Vec::new(),
            active_alternative_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.tool_calls = tool_calls;
        message
    }

    /// Empty assistant message that a generator streams into.
    pub fn assistant_draft() -> Self {
        let mut message = Self::new(Role::Assistant, String::new());
        message.state = MessageState::Draft;
        message.is_loading = true;
        message
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.tool_calls
            .iter()
            .flatten()
            .map(|call| call.id.as_str())
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Bumped by every [`Conversation::snapshot`]; orders concurrent writes.
    #[serde(default)]
    pub revision: u64,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            revision: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Appends a message, stamping it with this conversation's id.
    pub fn add_message(&mut self, mut message: Message) -> String {
        message.conversation_id = self.id.clone();
        let id = message.id.clone();
        self.messages.push(message);
        self.touch();
        id
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|message| message.id == message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    pub fn remove_message(&mut self, message_id: &str) -> Option<Message> {
        let index = self.position(message_id)?;
        self.touch();
        Some(self.messages.remove(index))
    }

    /// Closest user message before `index`.
    pub fn preceding_user_message(&self, index: usize) -> Option<&Message> {
        self.messages[..index.min(self.messages.len())]
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
    }

    pub fn find_branch(&self, branch_id: &str) -> Option<&Branch> {
        self.messages
            .iter()
            .flat_map(|message| message.branches.iter())
            .find(|branch| branch.id == branch_id)
    }

    pub fn find_branch_mut(&mut self, branch_id: &str) -> Option<&mut Branch> {
        self.messages
            .iter_mut()
            .flat_map(|message| message.branches.iter_mut())
            .find(|branch| branch.id == branch_id)
    }

    pub fn branch_ids(&self) -> Vec<String> {
        self.messages
            .iter()
            .flat_map(|message| message.branches.iter())
            .map(|branch| branch.id.clone())
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Copy to hand to a repository. Taken under the write lock, so a later
    /// snapshot always carries a higher revision than an earlier one.
    pub fn snapshot(&mut self) -> Conversation {
        self.revision += 1;
        self.clone()
    }
}
