use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::subagent::status::SubagentResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The parent is idle; handle the result now.
    Deliver(SubagentResult),
    /// Held until the parent finishes generating. `position` is 1-based.
    Queued { position: usize },
}

#[derive(Debug, Default)]
struct DeliveryState {
    parent_generating: bool,
    pending: VecDeque<SubagentResult>,
}

/// Keeps subagent results from interleaving with the parent's own
/// generation. Results are released in arrival order, one per call.
#[derive(Debug, Default)]
pub struct ResultDeliveryGuard {
    state: Mutex<DeliveryState>,
}

impl ResultDeliveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin_parent_generation(&self) {
        self.lock().parent_generating = true;
    }

    pub fn is_parent_generating(&self) -> bool {
        self.lock().parent_generating
    }

    pub fn submit(&self, result: SubagentResult) -> Delivery {
        let mut state = self.lock();
        if state.parent_generating || !state.pending.is_empty() {
            log::debug!(
                "[{}] Result queued behind parent generation",
                result.subagent_id
            );
            state.pending.push_back(result);
            return Delivery::Queued {
                position: state.pending.len(),
            };
        }
        Delivery::Deliver(result)
    }

    /// Marks the parent idle and releases the oldest queued result, if any.
    pub fn finish_parent_generation(&self) -> Option<SubagentResult> {
        let mut state = self.lock();
        state.parent_generating = false;
        state.pending.pop_front()
    }

    /// Next queued result while the parent is idle.
    pub fn next_pending(&self) -> Option<SubagentResult> {
        let mut state = self.lock();
        if state.parent_generating {
            return None;
        }
        state.pending.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}
