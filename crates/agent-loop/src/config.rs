use std::time::Duration;

use agent_core::config::{
    DEFAULT_CONTINUATION_PROMPT, DEFAULT_SUBAGENT_MAX_ITERATIONS, DEFAULT_SUBAGENT_RETENTION_SECS,
};
use agent_core::tools::ToolSchema;
use agent_core::EngineConfig;

/// Configuration for the subagent loop.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_iterations: usize,
    /// Used for new branches when the caller supplies none.
    pub system_prompt: Option<String>,
    pub continuation_prompt: String,
    pub model_name: Option<String>,
    pub max_output_tokens: Option<u32>,
    /// Offered to the model; the tool executor's own list when empty.
    pub tool_schemas: Vec<ToolSchema>,
    /// Finished subagents older than this are dropped from tracking.
    pub finished_retention: Duration,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_SUBAGENT_MAX_ITERATIONS,
            system_prompt: None,
            continuation_prompt: DEFAULT_CONTINUATION_PROMPT.to_string(),
            model_name: None,
            max_output_tokens: None,
            tool_schemas: Vec::new(),
            finished_retention: Duration::from_secs(DEFAULT_SUBAGENT_RETENTION_SECS),
        }
    }
}

impl From<&EngineConfig> for AgentLoopConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.subagent_max_iterations,
            system_prompt: Some(config.subagent_system_prompt.clone()),
            continuation_prompt: config.continuation_prompt.clone(),
            model_name: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            tool_schemas: Vec::new(),
            finished_retention: Duration::from_secs(config.subagent_retention_secs),
        }
    }
}
