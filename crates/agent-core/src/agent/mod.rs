pub mod branch;
pub mod error;
pub mod events;
pub mod types;

pub use branch::{Branch, BranchKind, BranchMetadata, SubagentState};
pub use error::AgentError;
pub use events::{ChatEvent, EventSink, NoopSink};
pub use types::{Conversation, Message, MessageState, Role};
