pub mod config;
pub mod runner;
pub mod stream;
pub mod subagent;

pub use config::AgentLoopConfig;
pub use runner::{BranchLoop, LoopOutcome};
pub use subagent::{
    Delivery, ResultDeliveryGuard, SubagentExecutor, SubagentHandle, SubagentParams,
    SubagentResult, SubagentStatus,
};
