use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use loom_core::cancel::Deadline;
use loom_core::events::AgentEvent;
use loom_core::ids::ToolCallId;
use loom_core::messages::ToolCallBlock;
use loom_core::session::SessionMode;
use loom_core::tools::{ConcurrencyPolicy, ToolContext, ToolError, ToolResult};

use crate::events::EventEmitter;
use crate::registry::ToolRegistry;
use crate::truncate;

const DEFAULT_MAX_OUTPUT: usize = 256 * 1024; // 256KB
const BASH_MAX_OUTPUT: usize = 1024 * 1024; // 1MB
const PREVIEW_CHARS: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on concurrent invocations within one segment.
    pub max_concurrency: usize,
    #[serde(with = "duration_ms")]
    pub tool_timeout: Duration,
    /// Per-tool timeout overrides, in milliseconds.
    pub timeout_overrides: HashMap<String, u64>,
    pub max_output_bytes: usize,
    pub output_limits: HashMap<String, usize>,
    /// Where full output of truncated results is saved. None keeps only the
    /// truncated text.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            tool_timeout: Duration::from_secs(120),
            timeout_overrides: HashMap::from([("Task".to_string(), 30 * 60 * 1000)]),
            max_output_bytes: DEFAULT_MAX_OUTPUT,
            output_limits: HashMap::from([("Bash".to_string(), BASH_MAX_OUTPUT)]),
            artifact_dir: None,
        }
    }
}

impl DispatchConfig {
    pub fn timeout_for(&self, tool_name: &str) -> Duration {
        self.timeout_overrides
            .get(tool_name)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(self.tool_timeout)
    }

    pub fn output_limit_for(&self, tool_name: &str) -> usize {
        self.output_limits
            .get(tool_name)
            .copied()
            .unwrap_or(self.max_output_bytes)
    }
}

/// One resolved call, in the position it was requested.
#[derive(Clone, Debug)]
pub struct DispatchedCall {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub result: ToolResult,
}

/// Runs one batch of tool calls.
///
/// The batch is split, in request order, into runs of consecutive concurrent
/// calls and single serial calls. A run of concurrent calls fans out up to
/// `max_concurrency`; a serial call starts only after everything before it has
/// finished and nothing after it starts until it is done.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    config: DispatchConfig,
    events: EventEmitter,
}

enum Segment<'a> {
    Concurrent(Vec<&'a ToolCallBlock>),
    Serial(&'a ToolCallBlock),
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, config: DispatchConfig, events: EventEmitter) -> Self {
        Self {
            registry,
            config,
            events,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id, agent_id = %ctx.agent_id, calls = calls.len()))]
    pub async fn dispatch(&self, calls: &[ToolCallBlock], ctx: &ToolContext) -> Vec<DispatchedCall> {
        let mut results = Vec::with_capacity(calls.len());
        for segment in self.segments(calls) {
            match segment {
                Segment::Serial(call) => results.push(self.run_one(call, ctx).await),
                Segment::Concurrent(batch) => {
                    let limit = self.config.max_concurrency.max(1);
                    // Boxed up front so the future stays Send when nested under Task.
                    let pending: Vec<_> = batch
                        .into_iter()
                        .map(|call| self.run_one(call, ctx).boxed())
                        .collect();
                    let done: Vec<DispatchedCall> = stream::iter(pending)
                        .buffered(limit)
                        .collect()
                        .await;
                    results.extend(done);
                }
            }
        }
        results
    }

    fn segments<'a>(&self, calls: &'a [ToolCallBlock]) -> Vec<Segment<'a>> {
        let mut segments = Vec::new();
        let mut run: Vec<&ToolCallBlock> = Vec::new();
        for call in calls {
            let policy = self
                .registry
                .descriptor(&call.name)
                .map(|d| d.policy)
                .unwrap_or(ConcurrencyPolicy::Concurrent);
            match policy {
                ConcurrencyPolicy::Concurrent => run.push(call),
                ConcurrencyPolicy::Serial => {
                    if !run.is_empty() {
                        segments.push(Segment::Concurrent(std::mem::take(&mut run)));
                    }
                    segments.push(Segment::Serial(call));
                }
            }
        }
        if !run.is_empty() {
            segments.push(Segment::Concurrent(run));
        }
        segments
    }

    async fn run_one(&self, call: &ToolCallBlock, ctx: &ToolContext) -> DispatchedCall {
        let start = Instant::now();

        // Calls that never started report cancellation without running anything.
        if ctx.abort_signal.is_cancelled() {
            debug!(tool = %call.name, "skipping call after cancellation");
            return self.finish(call, ctx, ToolResult::error("Cancelled before execution", Duration::ZERO));
        }

        self.events.emit(AgentEvent::ToolCallStart {
            session_id: ctx.session_id.clone(),
            agent_id: ctx.agent_id.clone(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let result = match self.invoke(call, ctx).await {
            Ok(result) => result,
            Err(message) => ToolResult::error(message, start.elapsed()),
        };
        let result = self.limit_output(call, result).await;
        self.finish(call, ctx, result)
    }

    /// Validate and execute. `Err` carries the text of an error result.
    async fn invoke(&self, call: &ToolCallBlock, ctx: &ToolContext) -> Result<ToolResult, String> {
        let (tool, descriptor) = match (self.registry.get(&call.name), self.registry.descriptor(&call.name)) {
            (Some(tool), Some(descriptor)) => (tool, descriptor),
            _ => return Err(format!("Unknown tool: {}", call.name)),
        };

        if !call.arguments.is_object() {
            return Err(format!(
                "Invalid arguments for {}: expected a JSON object, got {}",
                call.name,
                preview(&call.arguments.to_string())
            ));
        }

        if ctx.mode == SessionMode::Plan && !descriptor.plan_safe {
            return Err(format!(
                "{} is not available in plan mode. Present the plan with ExitPlanMode first",
                call.name
            ));
        }

        let timeout = self.config.timeout_for(&call.name);
        let deadline = Deadline::new(&ctx.abort_signal, Some(timeout));
        let mut tool_ctx = ctx.clone();
        tool_ctx.abort_signal = deadline.token().clone();

        let outcome = tokio::select! {
            biased;
            outcome = AssertUnwindSafe(tool.execute(call.arguments.clone(), &tool_ctx)).catch_unwind() => outcome,
            () = deadline.token().cancelled() => Ok(Err(ToolError::Cancelled)),
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(ToolError::Cancelled)) if deadline.timed_out() => {
                warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                Err(format!("Tool {} timed out after {}s", call.name, timeout.as_secs_f64()))
            }
            Ok(Err(ToolError::Cancelled)) => Err("Cancelled".into()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
                Err(format!("Internal error: tool {} crashed", call.name))
            }
        }
    }

    async fn limit_output(&self, call: &ToolCallBlock, mut result: ToolResult) -> ToolResult {
        let limit = self.config.output_limit_for(&call.name);
        if result.content.len() <= limit {
            return result;
        }
        let artifact = match &self.config.artifact_dir {
            Some(dir) => match truncate::write_artifact(dir, &call.id, &result.content).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "failed to save full tool output");
                    None
                }
            },
            None => None,
        };
        result.content = truncate::truncate_output(&result.content, limit, artifact.as_deref());
        result.truncated = true;
        result
    }

    fn finish(&self, call: &ToolCallBlock, ctx: &ToolContext, result: ToolResult) -> DispatchedCall {
        self.events.emit(AgentEvent::ToolCallResult {
            session_id: ctx.session_id.clone(),
            agent_id: ctx.agent_id.clone(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result_preview: preview(&result.content),
            is_error: result.is_error,
            truncated: result.truncated,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        });
        DispatchedCall {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result,
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
