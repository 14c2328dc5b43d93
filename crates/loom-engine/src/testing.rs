//! Shared fixtures for engine tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use loom_core::files::FileTracker;
use loom_core::ids::{AgentId, SessionId};
use loom_core::session::{SessionMode, TodoList};
use loom_core::tools::{Tool, ToolContext, ToolError, ToolResult};

#[derive(Clone, Debug)]
pub struct CallSpan {
    pub name: String,
    pub start: Instant,
    pub end: Instant,
}

impl CallSpan {
    pub fn overlaps(&self, other: &CallSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Clone)]
enum Behavior {
    Echo,
    Output(String),
    Fail,
    Panic,
}

/// Configurable tool that records when each invocation ran.
pub struct ScriptedTool {
    name: String,
    side_effects: bool,
    delay: Duration,
    behavior: Behavior,
    spans: Arc<Mutex<Vec<CallSpan>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTool {
    pub fn concurrent(name: &str) -> Self {
        Self::build(name, false)
    }

    pub fn serial(name: &str) -> Self {
        Self::build(name, true)
    }

    fn build(name: &str, side_effects: bool) -> Self {
        Self {
            name: name.to_string(),
            side_effects,
            delay: Duration::ZERO,
            behavior: Behavior::Echo,
            spans: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.behavior = Behavior::Output(output.into());
        self
    }

    pub fn failing(mut self) -> Self {
        self.behavior = Behavior::Fail;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    /// Share one span log between several tools.
    pub fn with_spans(mut self, spans: Arc<Mutex<Vec<CallSpan>>>) -> Self {
        self.spans = spans;
        self
    }

    pub fn spans(&self) -> Arc<Mutex<Vec<CallSpan>>> {
        Arc::clone(&self.spans)
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {"tag": {"type": "string"}}})
    }

    fn has_side_effects(&self) -> bool {
        self.side_effects
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = ctx.abort_signal.cancelled() => return Err(ToolError::Cancelled),
            }
        }
        self.spans.lock().push(CallSpan {
            name: self.name.clone(),
            start,
            end: Instant::now(),
        });
        match &self.behavior {
            Behavior::Echo => {
                let tag = args["tag"].as_str().unwrap_or_default();
                Ok(ToolResult::success(format!("{}:{tag}", self.name), start.elapsed()))
            }
            Behavior::Output(output) => Ok(ToolResult::success(output.clone(), start.elapsed())),
            Behavior::Fail => Err(ToolError::ExecutionFailed("scripted failure".into())),
            Behavior::Panic => panic!("scripted panic"),
        }
    }
}

pub fn tool_context(dir: &Path) -> ToolContext {
    ToolContext {
        session_id: SessionId::new(),
        agent_id: AgentId::new(),
        parent_agent_id: None,
        working_directory: dir.to_path_buf(),
        mode: SessionMode::Normal,
        files: FileTracker::new(),
        todos: TodoList::new(),
        abort_signal: CancellationToken::new(),
    }
}
