use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agent_core::config::DEFAULT_SUBAGENT_SYSTEM_PROMPT;
use agent_core::tools::ToolExecutor;
use agent_core::{
    AgentError, BranchMetadata, BranchRepository, ChatEvent, EventSink, Message, Role,
    SubagentState,
};
use agent_llm::LLMProvider;

use crate::config::AgentLoopConfig;
use crate::runner::{BranchLoop, LoopOutcome, Result};
use crate::subagent::status::{SubagentResult, SubagentRunner, SubagentStatus};

const LAST_ERROR_KEY: &str = "last_error";

#[derive(Debug, Clone, Default)]
pub struct SubagentParams {
    pub conversation_id: String,
    /// Message the new branch hangs off.
    pub parent_message_id: String,
    pub task: String,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<usize>,
    /// Resume this branch instead of creating one.
    pub continue_branch_id: Option<String>,
    pub continuation_prompt: Option<String>,
}

impl SubagentParams {
    pub fn new(
        conversation_id: impl Into<String>,
        parent_message_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            parent_message_id: parent_message_id.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn continuing(mut self, branch_id: impl Into<String>) -> Self {
        self.continue_branch_id = Some(branch_id.into());
        self
    }

    pub fn with_continuation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.continuation_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubagentHandle {
    pub subagent_id: String,
    pub branch_id: String,
}

/// Starts subagent loops in the background and tracks them by id.
#[derive(Clone)]
pub struct SubagentExecutor {
    llm: Arc<dyn LLMProvider>,
    tools: Arc<dyn ToolExecutor>,
    branches: Arc<dyn BranchRepository>,
    sink: Arc<dyn EventSink>,
    config: Arc<AgentLoopConfig>,
    runners: Arc<RwLock<HashMap<String, SubagentRunner>>>,
    completion_tx: Option<mpsc::UnboundedSender<SubagentResult>>,
}

impl SubagentExecutor {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        tools: Arc<dyn ToolExecutor>,
        branches: Arc<dyn BranchRepository>,
        sink: Arc<dyn EventSink>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            branches,
            sink,
            config: Arc::new(config),
            runners: Arc::new(RwLock::new(HashMap::new())),
            completion_tx: None,
        }
    }

    /// Every terminal transition is also sent here.
    pub fn with_completion_channel(mut self, tx: mpsc::UnboundedSender<SubagentResult>) -> Self {
        self.completion_tx = Some(tx);
        self
    }

    /// Prepares the branch and returns at once; the loop runs on its own task.
    pub async fn execute_subagent(&self, params: SubagentParams) -> Result<SubagentHandle> {
        let subagent_id = Uuid::new_v4().to_string();
        let max_iterations = params
            .max_iterations
            .unwrap_or(self.config.max_iterations);

        let (branch_id, cancel_token, iterations) = match params.continue_branch_id.clone() {
            Some(branch_id) => {
                let (cancel_token, iterations) = self.reserve(&subagent_id, &branch_id).await?;
                if let Err(error) = self
                    .prepare_continuation(&subagent_id, &branch_id, &params)
                    .await
                {
                    self.runners.write().await.remove(&subagent_id);
                    return Err(error);
                }
                (branch_id, cancel_token, iterations)
            }
            None => {
                let branch_id = self.create_branch(&subagent_id, &params).await?;
                let runner = SubagentRunner::new(branch_id.clone());
                let tracking = (runner.cancel_token.clone(), Arc::clone(&runner.iterations));
                let mut runners = self.runners.write().await;
                prune_expired(&mut runners, self.config.finished_retention);
                runners.insert(subagent_id.clone(), runner);
                (branch_id, tracking.0, tracking.1)
            }
        };

        log::info!(
            "[{}] Subagent started on branch {} (max {} rounds)",
            subagent_id,
            branch_id,
            max_iterations
        );
        self.emit_state(&subagent_id, &branch_id, SubagentState::Running);

        let executor = self.clone();
        let handle = SubagentHandle {
            subagent_id: subagent_id.clone(),
            branch_id: branch_id.clone(),
        };
        tokio::spawn(async move {
            executor
                .run(subagent_id, branch_id, max_iterations, cancel_token, iterations)
                .await;
        });
        Ok(handle)
    }

    /// Registers a runner for `branch_id` unless one is already running there.
    async fn reserve(
        &self,
        subagent_id: &str,
        branch_id: &str,
    ) -> Result<(CancellationToken, Arc<AtomicUsize>)> {
        let mut runners = self.runners.write().await;
        if runners
            .values()
            .any(|runner| runner.branch_id == branch_id && runner.is_running())
        {
            return Err(AgentError::AlreadyRunning(branch_id.to_string()));
        }
        prune_expired(&mut runners, self.config.finished_retention);
        let runner = SubagentRunner::new(branch_id.to_string());
        let tracking = (runner.cancel_token.clone(), Arc::clone(&runner.iterations));
        runners.insert(subagent_id.to_string(), runner);
        Ok(tracking)
    }

    async fn prepare_continuation(
        &self,
        subagent_id: &str,
        branch_id: &str,
        params: &SubagentParams,
    ) -> Result<()> {
        let branch = self
            .branches
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| AgentError::BranchNotFound(branch_id.to_string()))?;

        let mut metadata = branch.metadata;
        metadata.subagent_id = Some(subagent_id.to_string());
        metadata.state = Some(SubagentState::Running);
        metadata.extra.remove(LAST_ERROR_KEY);
        self.branches
            .update_branch_metadata(branch_id, metadata)
            .await?;

        let prompt = params
            .continuation_prompt
            .clone()
            .unwrap_or_else(|| self.config.continuation_prompt.clone());
        self.branches
            .add_message_to_branch(branch_id, Message::user(prompt))
            .await
    }

    async fn create_branch(&self, subagent_id: &str, params: &SubagentParams) -> Result<String> {
        let system_prompt = params
            .system_prompt
            .clone()
            .or_else(|| self.config.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SUBAGENT_SYSTEM_PROMPT.to_string());

        let mut metadata = BranchMetadata::for_task(params.task.clone());
        metadata.subagent_id = Some(subagent_id.to_string());
        metadata.state = Some(SubagentState::Running);

        let branch = self
            .branches
            .create_subagent_branch(
                &params.conversation_id,
                &params.parent_message_id,
                vec![
                    Message::system(system_prompt),
                    Message::user(params.task.clone()),
                ],
                metadata,
            )
            .await?;
        Ok(branch.id)
    }

    async fn run(
        &self,
        subagent_id: String,
        branch_id: String,
        max_iterations: usize,
        cancel_token: CancellationToken,
        iterations: Arc<AtomicUsize>,
    ) {
        let outcome = BranchLoop {
            branch_id: &branch_id,
            branches: self.branches.as_ref(),
            llm: self.llm.as_ref(),
            tools: self.tools.as_ref(),
            sink: self.sink.as_ref(),
            cancel_token: &cancel_token,
            config: self.config.as_ref(),
            max_iterations,
        }
        .run(|round| iterations.store(round, Ordering::SeqCst))
        .await;

        let (state, last_error) = match outcome {
            Ok(LoopOutcome::Complete { .. }) => (SubagentState::Complete, None),
            Ok(LoopOutcome::MaxIterations { .. }) => (SubagentState::MaxIterations, None),
            Err(error) if error.is_cancellation() => (SubagentState::Cancelled, None),
            Err(error) => {
                log::error!("[{}] Subagent failed: {}", subagent_id, error);
                (SubagentState::Error, Some(error.to_string()))
            }
        };

        self.finish(&subagent_id, &branch_id, state, last_error)
            .await;
    }

    async fn finish(
        &self,
        subagent_id: &str,
        branch_id: &str,
        state: SubagentState,
        last_error: Option<String>,
    ) {
        let summary = match self.branches.get_branch(branch_id).await {
            Ok(Some(branch)) => {
                let summary = branch
                    .messages
                    .iter()
                    .rev()
                    .find(|message| message.role == Role::Assistant && message.has_content())
                    .map(|message| message.content.clone());
                let mut metadata = branch.metadata;
                metadata.state = Some(state);
                if let Some(error) = &last_error {
                    metadata
                        .extra
                        .insert(LAST_ERROR_KEY.to_string(), error.clone().into());
                }
                if let Err(error) = self
                    .branches
                    .update_branch_metadata(branch_id, metadata)
                    .await
                {
                    log::warn!("[{}] Failed to persist final state: {}", subagent_id, error);
                }
                summary
            }
            Ok(None) => {
                log::warn!("[{}] Branch {} vanished before completion", subagent_id, branch_id);
                None
            }
            Err(error) => {
                log::warn!("[{}] Failed to load branch {}: {}", subagent_id, branch_id, error);
                None
            }
        };

        let transitioned = {
            let mut runners = self.runners.write().await;
            match runners.get_mut(subagent_id) {
                Some(runner) => runner.finish(state, last_error),
                // Tracking was cleared; the branch still records the outcome.
                None => true,
            }
        };
        if !transitioned {
            return;
        }

        log::info!("[{}] Subagent finished: {}", subagent_id, state.as_str());
        self.emit_state(subagent_id, branch_id, state);
        if let Some(tx) = &self.completion_tx {
            let result = SubagentResult {
                subagent_id: subagent_id.to_string(),
                branch_id: branch_id.to_string(),
                state,
                summary,
            };
            if tx.send(result).is_err() {
                log::debug!("[{}] Completion receiver dropped", subagent_id);
            }
        }
    }

    fn emit_state(&self, subagent_id: &str, branch_id: &str, state: SubagentState) {
        self.sink.emit(ChatEvent::SubagentStateChanged {
            subagent_id: subagent_id.to_string(),
            branch_id: branch_id.to_string(),
            state,
        });
    }

    /// Requests cancellation; the loop stops at its next checkpoint.
    pub async fn cancel_subagent(&self, subagent_id: &str) -> bool {
        let runners = self.runners.read().await;
        match runners.get(subagent_id) {
            Some(runner) if runner.is_running() => {
                runner.cancel_token.cancel();
                log::info!("[{}] Subagent cancellation triggered", subagent_id);
                true
            }
            Some(runner) => {
                log::debug!(
                    "[{}] Subagent already {}",
                    subagent_id,
                    runner.state.as_str()
                );
                false
            }
            None => false,
        }
    }

    /// Cancels everything still running and forgets all tracked subagents.
    pub async fn clear_agent_status(&self) {
        let mut runners = self.runners.write().await;
        let mut cancelled = 0;
        for runner in runners.values() {
            if runner.is_running() {
                runner.cancel_token.cancel();
                cancelled += 1;
            }
        }
        log::info!(
            "Cleared {} subagent(s), {} cancelled",
            runners.len(),
            cancelled
        );
        runners.clear();
    }

    /// Drops subagents that finished longer ago than the retention window.
    /// Also happens whenever a subagent starts.
    pub async fn prune_finished(&self) -> usize {
        let mut runners = self.runners.write().await;
        prune_expired(&mut runners, self.config.finished_retention)
    }

    pub async fn status(&self, subagent_id: &str) -> Option<SubagentStatus> {
        let runners = self.runners.read().await;
        runners.get(subagent_id).map(|runner| runner.status(subagent_id))
    }

    pub async fn active_subagents(&self) -> Vec<SubagentStatus> {
        let runners = self.runners.read().await;
        runners
            .iter()
            .filter(|(_, runner)| runner.is_running())
            .map(|(id, runner)| runner.status(id))
            .collect()
    }

    /// Waits for a terminal state. `None` for unknown or pruned ids, or when
    /// tracking is cleared while waiting.
    pub async fn wait_for_completion(&self, subagent_id: &str) -> Option<SubagentStatus> {
        let mut state_rx = {
            let runners = self.runners.read().await;
            runners.get(subagent_id)?.state_tx.subscribe()
        };
        let reached = state_rx
            .wait_for(|state| state.is_terminal())
            .await
            .is_ok();
        if !reached {
            return None;
        }
        self.status(subagent_id).await
    }
}

fn prune_expired(runners: &mut HashMap<String, SubagentRunner>, retention: Duration) -> usize {
    let before = runners.len();
    runners.retain(|_, runner| !runner.is_expired(retention));
    let pruned = before - runners.len();
    if pruned > 0 {
        log::debug!("Pruned {} finished subagent(s)", pruned);
    }
    pruned
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agent_core::tools::{ToolCall, ToolResult, ToolSchema};
    use agent_core::{Conversation, ConversationStore, MemoryRepository, MessageState, ToolError};
    use agent_llm::testing::{ScriptStep, ScriptedProvider};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    struct EchoTools;

    #[async_trait]
    impl ToolExecutor for EchoTools {
        async fn execute(&self, call: &ToolCall) -> std::result::Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(format!("ran {}", call.function.name)))
        }

        fn list_tools(&self) -> Vec<ToolSchema> {
            Vec::new()
        }
    }

    struct Fixture {
        executor: SubagentExecutor,
        provider: Arc<ScriptedProvider>,
        store: Arc<ConversationStore>,
        repository: Arc<MemoryRepository>,
        events: mpsc::UnboundedReceiver<ChatEvent>,
        results: mpsc::UnboundedReceiver<SubagentResult>,
        params: SubagentParams,
    }

    async fn fixture(provider: ScriptedProvider) -> Fixture {
        fixture_with(provider, AgentLoopConfig::default()).await
    }

    async fn fixture_with(provider: ScriptedProvider, config: AgentLoopConfig) -> Fixture {
        let provider = Arc::new(provider);
        let repository = Arc::new(MemoryRepository::new());
        let store = Arc::new(ConversationStore::new(repository.clone()));
        let mut conversation = Conversation::new("conv-1");
        conversation.add_message(Message::user("look into the build"));
        let parent = conversation.add_message(Message::assistant("delegating", None));
        store.create(conversation).await.unwrap();

        let (event_tx, events) = mpsc::unbounded_channel();
        let (result_tx, results) = mpsc::unbounded_channel();
        let executor = SubagentExecutor::new(
            provider.clone(),
            Arc::new(EchoTools),
            store.clone(),
            Arc::new(event_tx),
            config,
        )
        .with_completion_channel(result_tx);

        Fixture {
            executor,
            provider,
            store,
            repository,
            events,
            results,
            params: SubagentParams::new("conv-1", parent, "find the failing test"),
        }
    }

    async fn wait_for_token(events: &mut mpsc::UnboundedReceiver<ChatEvent>) {
        loop {
            match events.recv().await {
                Some(ChatEvent::StreamingUpdate { .. }) => return,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn completes_and_reports_summary() {
        let mut f = fixture(ScriptedProvider::text("test_parse is failing")).await;

        let handle = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        let status = f
            .executor
            .wait_for_completion(&handle.subagent_id)
            .await
            .unwrap();

        assert_eq!(status.state, SubagentState::Complete);
        assert_eq!(status.iterations, 1);
        assert!(status.completed_at.is_some());

        let result = f.results.recv().await.unwrap();
        assert_eq!(result.summary.as_deref(), Some("test_parse is failing"));

        let branch = f.store.get_branch(&handle.branch_id).await.unwrap().unwrap();
        assert_eq!(branch.messages.len(), 3);
        assert_eq!(branch.messages[0].role, Role::System);
        assert_eq!(branch.metadata.task.as_deref(), Some("find the failing test"));
        assert_eq!(branch.state(), Some(SubagentState::Complete));
        assert!(branch
            .messages
            .iter()
            .all(|message| message.conversation_id == handle.branch_id));
    }

    #[tokio::test]
    async fn tool_calls_every_round_hit_max_iterations() {
        let mut f = fixture(
            ScriptedProvider::new(Vec::new())
                .repeating(vec![ScriptStep::tool_call("c1", "ls", "{}"), ScriptStep::done()]),
        )
        .await;

        let handle = f
            .executor
            .execute_subagent(f.params.clone().with_max_iterations(2))
            .await
            .unwrap();
        let status = f
            .executor
            .wait_for_completion(&handle.subagent_id)
            .await
            .unwrap();

        assert_eq!(status.state, SubagentState::MaxIterations);
        assert_eq!(status.iterations, 2);
        assert_eq!(f.provider.call_count(), 2);
        assert_eq!(f.results.recv().await.unwrap().state, SubagentState::MaxIterations);

        let branch = f.store.get_branch(&handle.branch_id).await.unwrap().unwrap();
        let tool_results = branch
            .messages
            .iter()
            .filter(|message| message.role == Role::Tool)
            .count();
        assert_eq!(tool_results, 2);
    }

    #[tokio::test]
    async fn cancel_while_blocked_on_a_chunk() {
        let gate = Arc::new(Notify::new());
        let mut f = fixture(ScriptedProvider::new(vec![vec![
            ScriptStep::token("thinking"),
            ScriptStep::WaitFor(gate.clone()),
            ScriptStep::token(" more"),
            ScriptStep::done(),
        ]]))
        .await;

        let handle = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        wait_for_token(&mut f.events).await;

        assert!(f.executor.cancel_subagent(&handle.subagent_id).await);
        assert!(f.executor.cancel_subagent(&handle.subagent_id).await);
        assert_eq!(f.executor.active_subagents().await.len(), 1);

        gate.notify_one();
        let status = f
            .executor
            .wait_for_completion(&handle.subagent_id)
            .await
            .unwrap();

        assert_eq!(status.state, SubagentState::Cancelled);
        assert!(f.executor.active_subagents().await.is_empty());
        assert!(!f.executor.cancel_subagent(&handle.subagent_id).await);

        let branch = f.store.get_branch(&handle.branch_id).await.unwrap().unwrap();
        let last = branch.messages.last().unwrap();
        assert_eq!(last.content, "thinking");
        assert_eq!(last.state, MessageState::Aborted);
        assert_eq!(branch.state(), Some(SubagentState::Cancelled));
    }

    #[tokio::test]
    async fn continuation_resumes_the_same_branch() {
        let f = fixture(ScriptedProvider::new(vec![
            vec![ScriptStep::token("first pass"), ScriptStep::done()],
            vec![ScriptStep::token("second pass"), ScriptStep::done()],
        ]))
        .await;

        let first = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        f.executor.wait_for_completion(&first.subagent_id).await.unwrap();

        let second = f
            .executor
            .execute_subagent(
                f.params
                    .clone()
                    .continuing(first.branch_id.clone())
                    .with_continuation_prompt("also check the docs"),
            )
            .await
            .unwrap();
        assert_eq!(second.branch_id, first.branch_id);
        assert_ne!(second.subagent_id, first.subagent_id);

        let status = f
            .executor
            .wait_for_completion(&second.subagent_id)
            .await
            .unwrap();
        assert_eq!(status.state, SubagentState::Complete);

        let branch = f.store.get_branch(&first.branch_id).await.unwrap().unwrap();
        let contents: Vec<&str> = branch.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[2..], &["first pass", "also check the docs", "second pass"]);
        assert_eq!(
            branch.metadata.subagent_id.as_deref(),
            Some(second.subagent_id.as_str())
        );

        let requests = f.provider.requests().await;
        assert_eq!(requests[1].prompt, "also check the docs");
    }

    #[tokio::test]
    async fn continuing_an_unknown_branch_fails() {
        let f = fixture(ScriptedProvider::text("unused")).await;

        let error = f
            .executor
            .execute_subagent(f.params.clone().continuing("missing"))
            .await
            .expect_err("unknown branch");

        assert!(matches!(error, AgentError::BranchNotFound(_)));
        assert!(f.executor.active_subagents().await.is_empty());
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn a_running_branch_cannot_be_continued() {
        let gate = Arc::new(Notify::new());
        let mut f = fixture(ScriptedProvider::new(vec![vec![
            ScriptStep::token("busy"),
            ScriptStep::WaitFor(gate.clone()),
            ScriptStep::done(),
        ]]))
        .await;

        let handle = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        wait_for_token(&mut f.events).await;

        let error = f
            .executor
            .execute_subagent(f.params.clone().continuing(handle.branch_id.clone()))
            .await
            .expect_err("already running");
        assert!(matches!(error, AgentError::AlreadyRunning(_)));

        gate.notify_one();
        let status = f
            .executor
            .wait_for_completion(&handle.subagent_id)
            .await
            .unwrap();
        assert_eq!(status.state, SubagentState::Complete);
    }

    #[tokio::test]
    async fn failures_are_kept_out_of_the_transcript() {
        let f = fixture(ScriptedProvider::new(vec![vec![ScriptStep::Fail(
            "upstream 502".to_string(),
        )]]))
        .await;

        let handle = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        let status = f
            .executor
            .wait_for_completion(&handle.subagent_id)
            .await
            .unwrap();

        assert_eq!(status.state, SubagentState::Error);
        assert!(status.last_error.as_deref().unwrap().contains("upstream 502"));

        let branch = f.store.get_branch(&handle.branch_id).await.unwrap().unwrap();
        assert_eq!(branch.messages.len(), 2);
        assert!(branch
            .messages
            .iter()
            .all(|message| !message.content.contains("502")));
        let recorded = branch.metadata.extra.get(LAST_ERROR_KEY).and_then(|v| v.as_str());
        assert!(recorded.unwrap().contains("upstream 502"));
    }

    #[tokio::test]
    async fn clearing_status_cancels_running_subagents() {
        let gate = Arc::new(Notify::new());
        let mut f = fixture(ScriptedProvider::new(vec![vec![
            ScriptStep::token("working"),
            ScriptStep::WaitFor(gate.clone()),
            ScriptStep::done(),
        ]]))
        .await;

        let handle = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        wait_for_token(&mut f.events).await;

        f.executor.clear_agent_status().await;
        assert!(f.executor.status(&handle.subagent_id).await.is_none());
        gate.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(5), f.results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.state, SubagentState::Cancelled);

        let branch = f.store.get_branch(&handle.branch_id).await.unwrap().unwrap();
        assert_eq!(branch.state(), Some(SubagentState::Cancelled));
    }

    #[tokio::test]
    async fn parallel_subagents_on_one_conversation_keep_their_own_state() {
        let first_gate = Arc::new(Notify::new());
        let second_gate = Arc::new(Notify::new());
        let mut f = fixture(ScriptedProvider::new(vec![
            vec![
                ScriptStep::token("first"),
                ScriptStep::WaitFor(first_gate.clone()),
                ScriptStep::done(),
            ],
            vec![
                ScriptStep::token("second"),
                ScriptStep::WaitFor(second_gate.clone()),
                ScriptStep::done(),
            ],
        ]))
        .await;

        let first = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        wait_for_token(&mut f.events).await;
        let second = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        wait_for_token(&mut f.events).await;
        assert_ne!(first.branch_id, second.branch_id);
        assert_eq!(f.executor.active_subagents().await.len(), 2);

        second_gate.notify_one();
        let status = f
            .executor
            .wait_for_completion(&second.subagent_id)
            .await
            .unwrap();
        assert_eq!(status.state, SubagentState::Complete);

        assert!(f.executor.cancel_subagent(&first.subagent_id).await);
        first_gate.notify_one();
        let status = f
            .executor
            .wait_for_completion(&first.subagent_id)
            .await
            .unwrap();
        assert_eq!(status.state, SubagentState::Cancelled);

        let delivered: Vec<String> = vec![
            f.results.recv().await.unwrap().subagent_id,
            f.results.recv().await.unwrap().subagent_id,
        ];
        assert_eq!(delivered, vec![second.subagent_id.clone(), first.subagent_id.clone()]);

        let persisted = f.repository.stored("conv-1").await.unwrap();
        for (handle, expected) in [
            (&first, SubagentState::Cancelled),
            (&second, SubagentState::Complete),
        ] {
            let live = f.store.get_branch(&handle.branch_id).await.unwrap().unwrap();
            assert_eq!(live.state(), Some(expected));
            assert_eq!(
                persisted.find_branch(&handle.branch_id).unwrap().state(),
                Some(expected)
            );
        }
    }

    #[tokio::test]
    async fn finished_subagents_are_pruned_after_retention() {
        let config = AgentLoopConfig {
            finished_retention: Duration::ZERO,
            ..Default::default()
        };
        let f = fixture_with(
            ScriptedProvider::new(vec![
                vec![ScriptStep::token("one"), ScriptStep::done()],
                vec![ScriptStep::token("two"), ScriptStep::done()],
            ]),
            config,
        )
        .await;

        let first = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        f.executor.wait_for_completion(&first.subagent_id).await.unwrap();

        let second = f.executor.execute_subagent(f.params.clone()).await.unwrap();
        assert!(f.executor.status(&first.subagent_id).await.is_none());

        f.executor.wait_for_completion(&second.subagent_id).await.unwrap();
        assert_eq!(f.executor.prune_finished().await, 1);
        assert!(f.executor.status(&second.subagent_id).await.is_none());

        let branch = f.store.get_branch(&first.branch_id).await.unwrap().unwrap();
        assert_eq!(branch.state(), Some(SubagentState::Complete));
    }
}
