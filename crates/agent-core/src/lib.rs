pub mod agent;
pub mod config;
pub mod storage;
pub mod store;
pub mod tools;

pub use agent::{
    AgentError, Branch, BranchKind, BranchMetadata, ChatEvent, Conversation, EventSink, Message,
    MessageState, NoopSink, Role, SubagentState,
};
pub use config::EngineConfig;
pub use storage::{
    BranchRepository, ConversationRepository, JsonlStorage, MemoryRepository, OrderedRepository,
};
pub use store::{ConversationStore, SharedConversation};
pub use tools::{
    execute_tool_call, filter_completed_tool_calls, is_tool_call_completed, FunctionCall,
    ToolCall, ToolCallAccumulator, ToolError, ToolExecutor, ToolResult, ToolSchema,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
