use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::types::Message;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    HumanRetry,
    Subagent,
}

/// Run state of a subagent branch. Every state except `Running` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubagentState {
    Running,
    Complete,
    MaxIterations,
    Cancelled,
    Error,
}

impl SubagentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubagentState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentState::Running => "running",
            SubagentState::Complete => "complete",
            SubagentState::MaxIterations => "max_iterations",
            SubagentState::Cancelled => "cancelled",
            SubagentState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BranchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SubagentState>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BranchMetadata {
    pub fn for_task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// An alternative continuation rooted at a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub kind: BranchKind,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BranchMetadata,
}

impl Branch {
    pub fn new(kind: BranchKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: BranchMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: BranchMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Appends a message; branch messages carry the branch id as their
    /// conversation id.
    pub fn push_message(&mut self, mut message: Message) {
        message.conversation_id = self.id.clone();
        self.messages.push(message);
        self.touch();
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    pub fn first_message(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn state(&self) -> Option<SubagentState> {
        self.metadata.state
    }

    pub fn set_state(&mut self, state: SubagentState) {
        self.metadata.state = Some(state);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
