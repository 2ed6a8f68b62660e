use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use agent_core::SubagentState;

#[derive(Debug, Clone, Serialize)]
pub struct SubagentStatus {
    pub subagent_id: String,
    pub branch_id: String,
    pub state: SubagentState,
    pub iterations: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Handed to the result consumer on every terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubagentResult {
    pub subagent_id: String,
    pub branch_id: String,
    pub state: SubagentState,
    /// Content of the last assistant message in the branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

pub(crate) struct SubagentRunner {
    pub branch_id: String,
    pub state: SubagentState,
    pub cancel_token: CancellationToken,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub iterations: Arc<AtomicUsize>,
    pub state_tx: watch::Sender<SubagentState>,
}

impl SubagentRunner {
    pub fn new(branch_id: String) -> Self {
        let (state_tx, _) = watch::channel(SubagentState::Running);
        Self {
            branch_id,
            state: SubagentState::Running,
            cancel_token: CancellationToken::new(),
            started_at: Utc::now(),
            completed_at: None,
            last_error: None,
            iterations: Arc::new(AtomicUsize::new(0)),
            state_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Moves to a terminal state once; later calls are ignored.
    pub fn finish(&mut self, state: SubagentState, last_error: Option<String>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.state = state;
        self.completed_at = Some(Utc::now());
        self.last_error = last_error;
        self.state_tx.send_replace(state);
        true
    }

    /// Finished at least `retention` ago.
    pub fn is_expired(&self, retention: Duration) -> bool {
        self.completed_at.is_some_and(|completed_at| {
            (Utc::now() - completed_at)
                .to_std()
                .is_ok_and(|age| age >= retention)
        })
    }

    pub fn status(&self, subagent_id: &str) -> SubagentStatus {
        SubagentStatus {
            subagent_id: subagent_id.to_string(),
            branch_id: self.branch_id.clone(),
            state: self.state,
            iterations: self.iterations.load(Ordering::SeqCst),
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_happens_once() {
        let mut runner = SubagentRunner::new("branch-1".to_string());
        let mut rx = runner.state_tx.subscribe();

        assert!(runner.finish(SubagentState::Cancelled, None));
        assert!(!runner.finish(SubagentState::Complete, None));

        let status = runner.status("sub-1");
        assert_eq!(status.state, SubagentState::Cancelled);
        assert!(status.completed_at.is_some());
        assert_eq!(*rx.borrow_and_update(), SubagentState::Cancelled);
    }

    #[test]
    fn only_finished_runners_expire() {
        let mut runner = SubagentRunner::new("branch-1".to_string());
        assert!(!runner.is_expired(Duration::ZERO));

        runner.finish(SubagentState::Complete, None);
        assert!(runner.is_expired(Duration::ZERO));
        assert!(!runner.is_expired(Duration::from_secs(3600)));
    }
}
