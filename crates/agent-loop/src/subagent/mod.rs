//! Subagents: autonomous loops that work a delegated task inside a branch of
//! the parent conversation.

pub mod delivery;
pub mod executor;
pub mod status;

pub use delivery::{Delivery, ResultDeliveryGuard};
pub use executor::{SubagentExecutor, SubagentHandle, SubagentParams};
pub use status::{SubagentResult, SubagentStatus};
