//! The execution engine: tool registry and dispatch, context management and
//! compaction, plan approval, sub-agents, and the turn loop that ties them together.

pub mod approval;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod subagent;
pub mod tools;
pub mod truncate;

#[cfg(test)]
mod testing;

pub use approval::{ApprovalRequest, AutoApprove, AutoReject, ChannelApprover, PlanApprover, PlanDecision};
pub use context::{ContextConfig, ContextManager};
pub use dispatcher::{DispatchConfig, DispatchedCall, ToolDispatcher};
pub use engine::{EngineConfig, StreamConfig, TurnEngine, TurnInput, TurnOutcome, TurnState, PLAN_REJECTED_RESULT};
pub use error::EngineError;
pub use events::EventEmitter;
pub use registry::{ToolDescriptor, ToolFilter, ToolRegistry};
pub use subagent::{AgentProfile, ProfileTable, SubagentManager, SubagentOutcome};
