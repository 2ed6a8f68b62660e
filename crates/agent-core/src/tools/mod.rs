pub mod accumulator;
pub mod classifier;
pub mod executor;
pub mod types;

pub use accumulator::{
    finalize_tool_calls, update_partial_tool_call, PartialToolCall, ToolCallAccumulator,
};
pub use classifier::{filter_completed_tool_calls, is_tool_call_completed};
pub use executor::{execute_tool_call, parse_tool_args, ToolError, ToolExecutor};
pub use types::{FunctionCall, FunctionSchema, ToolCall, ToolResult, ToolSchema};
