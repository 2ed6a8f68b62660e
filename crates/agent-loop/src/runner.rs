use tokio_util::sync::CancellationToken;

use agent_core::tools::{execute_tool_call, parse_tool_args, ToolExecutor};
use agent_core::{
    filter_completed_tool_calls, AgentError, BranchRepository, EventSink, Message, MessageState,
    Role,
};
use agent_llm::{GenerationOptions, LLMProvider};

use crate::config::AgentLoopConfig;
use crate::stream::handler::{consume_llm_stream, StreamHandlingOutput};

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The model answered without requesting tools.
    Complete { iterations: usize },
    /// Every round asked for more tools.
    MaxIterations { iterations: usize },
}

/// One bounded generate/execute loop over a branch's history.
pub struct BranchLoop<'a> {
    pub branch_id: &'a str,
    pub branches: &'a dyn BranchRepository,
    pub llm: &'a dyn LLMProvider,
    pub tools: &'a dyn ToolExecutor,
    pub sink: &'a dyn EventSink,
    pub cancel_token: &'a CancellationToken,
    pub config: &'a AgentLoopConfig,
    pub max_iterations: usize,
}

impl BranchLoop<'_> {
    fn ensure_active(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    /// Runs until the model stops calling tools or the iteration budget is
    /// spent. `on_iteration` is told the 1-based number of each round.
    pub async fn run<F>(&self, mut on_iteration: F) -> Result<LoopOutcome>
    where
        F: FnMut(usize) + Send,
    {
        let tool_schemas = if self.config.tool_schemas.is_empty() {
            self.tools.list_tools()
        } else {
            self.config.tool_schemas.clone()
        };

        for round in 0..self.max_iterations {
            self.ensure_active()?;
            on_iteration(round + 1);
            log::debug!(
                "[{}] Round {}/{}",
                self.branch_id,
                round + 1,
                self.max_iterations
            );

            let branch = self
                .branches
                .get_branch(self.branch_id)
                .await?
                .ok_or_else(|| AgentError::BranchNotFound(self.branch_id.to_string()))?;
            self.ensure_active()?;

            let prompt = branch
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::User)
                .map(|message| message.content.clone())
                .unwrap_or_default();
            let options = GenerationOptions::new(self.cancel_token.clone())
                .with_model(self.config.model_name.clone())
                .with_max_output_tokens(self.config.max_output_tokens)
                .with_tools(tool_schemas.clone());

            let stream = self
                .llm
                .chat_stream(&branch.messages, &prompt, &options)
                .await?;
            self.ensure_active()?;

            let mut assistant = Message::assistant_draft();
            let mut output = StreamHandlingOutput::default();
            let streamed = consume_llm_stream(
                stream,
                &mut output,
                self.sink,
                self.cancel_token,
                &assistant.id,
            )
            .await;

            if let Err(error) = streamed {
                if error.is_cancellation() {
                    self.keep_partial(assistant, &output).await;
                }
                return Err(error);
            }

            let tool_calls = output.tool_calls.finalize();
            assistant.content = output.content;
            assistant.reasoning = (!output.reasoning.is_empty()).then_some(output.reasoning);
            assistant.tool_calls = (!tool_calls.is_empty()).then(|| tool_calls.clone());
            assistant.state = MessageState::Complete;
            assistant.is_loading = false;
            self.branches
                .add_message_to_branch(self.branch_id, assistant.clone())
                .await?;

            if tool_calls.is_empty() {
                // The answer is stored as complete, but a cancel that landed
                // while it was being written still wins.
                self.ensure_active()?;
                log::info!(
                    "[{}] Completed after {} round(s)",
                    self.branch_id,
                    round + 1
                );
                return Ok(LoopOutcome::Complete {
                    iterations: round + 1,
                });
            }

            self.execute_tools(&mut assistant).await?;
        }

        log::info!(
            "[{}] Stopped after reaching {} rounds",
            self.branch_id,
            self.max_iterations
        );
        Ok(LoopOutcome::MaxIterations {
            iterations: self.max_iterations,
        })
    }

    async fn execute_tools(&self, assistant: &mut Message) -> Result<()> {
        let calls = assistant.tool_calls.clone().unwrap_or_default();
        for (index, call) in calls.iter().enumerate() {
            if self.cancel_token.is_cancelled() {
                self.abort_tool_round(assistant).await;
                return Err(AgentError::Cancelled);
            }

            let args = parse_tool_args(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::json!({}));
            log::debug!(
                "[{}] Executing tool {} ({}) with {}",
                self.branch_id,
                call.function.name,
                call.id,
                args
            );
            let result = execute_tool_call(call, self.tools).await;

            if self.cancel_token.is_cancelled() {
                self.abort_tool_round(assistant).await;
                return Err(AgentError::Cancelled);
            }

            if let Some(recorded) = assistant
                .tool_calls
                .as_mut()
                .and_then(|calls| calls.get_mut(index))
            {
                recorded.apply_result(&result);
            }
            assistant.touch();
            self.branches
                .update_message_in_branch(self.branch_id, assistant)
                .await?;
            self.branches
                .add_message_to_branch(
                    self.branch_id,
                    Message::tool_result(call.id.clone(), result.result),
                )
                .await?;
        }
        Ok(())
    }

    /// Stores what streamed before cancellation. Empty output is dropped.
    async fn keep_partial(&self, mut assistant: Message, output: &StreamHandlingOutput) {
        if !output.has_content() {
            log::debug!("[{}] Discarding empty cancelled message", self.branch_id);
            return;
        }
        assistant.content = output.content.clone();
        assistant.reasoning = output.reasoning();
        assistant.tool_calls = filter_completed_tool_calls(Some(output.tool_calls().as_slice()));
        assistant.state = MessageState::Aborted;
        assistant.is_loading = false;
        if let Err(error) = self
            .branches
            .add_message_to_branch(self.branch_id, assistant)
            .await
        {
            log::warn!("[{}] Failed to keep partial message: {}", self.branch_id, error);
        }
    }

    /// Cancelled between tools: calls that never ran are dropped from the
    /// assistant message.
    async fn abort_tool_round(&self, assistant: &mut Message) {
        assistant.tool_calls = filter_completed_tool_calls(assistant.tool_calls.as_deref());
        assistant.state = MessageState::Aborted;
        assistant.touch();
        if let Err(error) = self
            .branches
            .update_message_in_branch(self.branch_id, assistant)
            .await
        {
            log::warn!("[{}] Failed to mark tool round aborted: {}", self.branch_id, error);
        }
    }
}
