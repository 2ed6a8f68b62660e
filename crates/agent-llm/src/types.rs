use agent_core::tools::ToolCall;

#[derive(Debug, Clone, PartialEq)]
pub enum LLMChunk {
    Token(String),
    Reasoning(String),
    /// Tool call fragments; merge them with a `ToolCallAccumulator`.
    ToolCalls(Vec<ToolCall>),
    Done,
}
