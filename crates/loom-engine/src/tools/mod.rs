mod fs_ops;

pub mod bash;
pub mod edit;
pub mod glob;
pub mod grep;
pub mod plan_mode;
pub mod read;
pub mod task;
pub mod todo_write;
pub mod write;

use std::sync::Arc;

use loom_core::tools::Tool;

use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::subagent::SubagentManager;

/// Every built-in tool except `Task`. Sub-agents draw from this set.
pub fn leaf_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        // File operations
        Arc::new(read::ReadTool),
        Arc::new(write::WriteTool),
        Arc::new(edit::EditTool),
        // Search
        Arc::new(glob::GlobTool),
        Arc::new(grep::GrepTool),
        // Shell
        Arc::new(bash::BashTool::new()),
        // Session state
        Arc::new(todo_write::TodoWriteTool),
        Arc::new(plan_mode::EnterPlanModeTool),
        Arc::new(plan_mode::ExitPlanModeTool),
    ]
}

/// The top-level registry: leaf tools plus `Task` backed by `manager`.
pub fn default_registry(manager: Arc<SubagentManager>) -> Result<ToolRegistry, EngineError> {
    let mut tools = leaf_tools();
    tools.push(Arc::new(task::TaskTool::new(manager)));
    ToolRegistry::from_tools(tools)
}
