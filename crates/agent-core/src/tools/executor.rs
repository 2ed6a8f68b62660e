use async_trait::async_trait;
use thiserror::Error;

use crate::tools::{ToolCall, ToolResult, ToolSchema};

#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

pub type Result<T> = std::result::Result<T, ToolError>;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> Result<ToolResult>;
    fn list_tools(&self) -> Vec<ToolSchema>;
}

/// Runs a call and folds executor errors into an unsuccessful result, so the
/// model sees the failure as the tool's answer.
pub async fn execute_tool_call(tool_call: &ToolCall, tools: &dyn ToolExecutor) -> ToolResult {
    match tools.execute(tool_call).await {
        Ok(result) => result,
        Err(error) => {
            log::warn!(
                "Tool '{}' ({}) failed: {}",
                tool_call.function.name,
                tool_call.id,
                error
            );
            ToolResult::failed(format!("Error: {error}"))
        }
    }
}

pub fn parse_tool_args(arguments: &str) -> Result<serde_json::Value> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(arguments).map_err(|error| ToolError::InvalidArguments(error.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct StaticExecutor {
        results: HashMap<String, ToolResult>,
    }

    #[async_trait]
    impl ToolExecutor for StaticExecutor {
        async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
            self.results
                .get(&call.function.name)
                .cloned()
                .ok_or_else(|| ToolError::NotFound(call.function.name.clone()))
        }

        fn list_tools(&self) -> Vec<ToolSchema> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn execute_tool_call_returns_executor_result() {
        let mut results = HashMap::new();
        results.insert("search".to_string(), ToolResult::ok("3 hits"));
        let tools = StaticExecutor { results };

        let result = execute_tool_call(&ToolCall::new("call_1", "search", "{}"), &tools).await;

        assert!(result.success);
        assert_eq!(result.result, "3 hits");
    }

    #[tokio::test]
    async fn execute_tool_call_folds_errors_into_failed_result() {
        let tools = StaticExecutor {
            results: HashMap::new(),
        };

        let result = execute_tool_call(&ToolCall::new("call_1", "missing", "{}"), &tools).await;

        assert!(!result.success);
        assert_eq!(result.result, "Error: Tool not found: missing");
    }

    #[test]
    fn parse_tool_args_accepts_blank_arguments() {
        assert_eq!(parse_tool_args("  ").unwrap(), serde_json::json!({}));
        assert!(parse_tool_args("{not json").is_err());
    }
}
