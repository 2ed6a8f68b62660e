use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("LLM error: {0}")]
    LLM(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// Cancellation is an expected outcome, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
