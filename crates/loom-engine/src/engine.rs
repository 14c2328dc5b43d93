//! The turn loop: prepare context, call the model, dispatch tools, repeat.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use loom_core::context::LlmContext;
use loom_core::errors::GatewayError;
use loom_core::events::{AgentEvent, OutcomeKind};
use loom_core::ids::{AgentId, SessionId};
use loom_core::messages::{AssistantMessage, FinishReason, Message, SystemKind, ToolCallBlock};
use loom_core::provider::{LlmProvider, StreamOptions, ThinkingConfig};
use loom_core::session::{Session, SessionMode, SessionStatus};
use loom_core::stream::StreamEvent;
use loom_core::tokens::TokenUsage;
use loom_core::tools::{SideEffect, ToolContext, ToolDefinition};
use loom_store::SessionStore;

use crate::approval::{AutoReject, PlanApprover, PlanDecision};
use crate::context::{compact, reminders, ContextConfig, ContextManager};
use crate::dispatcher::{DispatchConfig, ToolDispatcher};
use crate::error::EngineError;
use crate::events::EventEmitter;
use crate::registry::ToolRegistry;

/// Result text when the user turns down a submitted plan.
pub const PLAN_REJECTED_RESULT: &str = "Plan mode maintained, awaiting further instructions.";

const INTERRUPTED_NOTICE: &str = "Interrupted by user";
const CANCELLED_CALL: &str = "Cancelled by user before execution";
const FAILED_CALL: &str = "Not executed: the turn failed";
const PLAN_APPROVED_NOTICE: &str =
    "The user approved the plan. Plan mode is off; proceed with the implementation.";
const PLAN_REJECTED_NOTICE: &str =
    "The user rejected the plan. Stay in plan mode and wait for further instructions.";

/// Sampling options applied to every model call of a turn.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub thinking: ThinkingConfig,
    pub stop_sequences: Vec<String>,
}

impl StreamConfig {
    pub fn to_options(&self) -> StreamOptions {
        StreamOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            thinking: self.thinking.clone(),
            stop_sequences: self.stop_sequences.clone(),
            cancel: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model calls allowed per run before the engine stops on its own.
    pub max_steps: u32,
    pub stream: StreamConfig,
    pub dispatch: DispatchConfig,
    pub context: ContextConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            stream: StreamConfig::default(),
            dispatch: DispatchConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    PreparingTurn,
    AwaitingModel,
    ExecutingTools,
    AwaitingPlanApproval,
    Completed,
    Interrupted,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Failed)
    }

    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (from, Interrupted | Failed) => !from.is_terminal(),
            (Idle | Completed | Interrupted | Failed, PreparingTurn) => true,
            (PreparingTurn, AwaitingModel) => true,
            (AwaitingModel, ExecutingTools | Completed) => true,
            (ExecutingTools, AwaitingPlanApproval | PreparingTurn | Completed) => true,
            (AwaitingPlanApproval, PreparingTurn | Completed) => true,
            _ => false,
        }
    }
}

/// What starts a run.
#[derive(Clone, Debug)]
pub enum TurnInput {
    UserText(String),
    /// Resume from the existing history without new input.
    Continue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { result: String, steps: u32 },
    Interrupted { steps: u32 },
    Failed { kind: String, error: String, steps: u32 },
}

impl TurnOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Completed { .. } => OutcomeKind::Completed,
            Self::Interrupted { .. } => OutcomeKind::Interrupted,
            Self::Failed { .. } => OutcomeKind::Failed,
        }
    }

    pub fn result_text(&self) -> Option<&str> {
        match self {
            Self::Completed { result, .. } => Some(result),
            Self::Failed { error, .. } => Some(error),
            Self::Interrupted { .. } => None,
        }
    }

    pub fn steps(&self) -> u32 {
        match self {
            Self::Completed { steps, .. } | Self::Interrupted { steps } | Self::Failed { steps, .. } => {
                *steps
            }
        }
    }
}

/// Drives one session through model calls and tool dispatch until the model
/// stops, the step budget runs out, a plan is rejected, the run is cancelled,
/// or an unrecoverable error occurs.
///
/// The engine borrows the session mutably for the whole run; nothing else
/// writes to it meanwhile.
pub struct TurnEngine {
    provider: Arc<dyn LlmProvider>,
    dispatcher: ToolDispatcher,
    context: ContextManager,
    store: Arc<dyn SessionStore>,
    events: EventEmitter,
    approver: Arc<dyn PlanApprover>,
    config: EngineConfig,
    agent_id: AgentId,
    parent_agent_id: Option<AgentId>,
    state: Mutex<TurnState>,
}

impl TurnEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: ToolRegistry,
        store: Arc<dyn SessionStore>,
        events: EventEmitter,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            dispatcher: ToolDispatcher::new(registry, config.dispatch.clone(), events.clone()),
            context: ContextManager::new(config.context.clone()),
            store,
            events,
            approver: Arc::new(AutoReject),
            config,
            agent_id: AgentId::new(),
            parent_agent_id: None,
            state: Mutex::new(TurnState::Idle),
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn PlanApprover>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_profile_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.context = self.context.with_profile_prompt(prompt);
        self
    }

    pub fn with_agent_id(mut self, agent_id: AgentId, parent: Option<AgentId>) -> Self {
        self.agent_id = agent_id;
        self.parent_agent_id = parent;
        self
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.dispatcher.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run until a terminal outcome. Always emits `TurnFinish` last.
    #[instrument(skip_all, fields(session_id = %session.id, agent_id = %self.agent_id))]
    pub async fn run(&self, session: &mut Session, input: TurnInput, cancel: &CancellationToken) -> TurnOutcome {
        let mut last_usage = None;
        let result = match self.begin(session, input) {
            Ok(()) => self.drive(session, cancel, &mut last_usage).await,
            Err(e) => Err(e),
        };
        let result = result.and_then(|text| self.persist(session).map(|()| text));

        let steps = session.step;
        let outcome = match result {
            Ok(result) => {
                self.transition(TurnState::Completed);
                info!(steps, "turn completed");
                TurnOutcome::Completed { result, steps }
            }
            Err(e) if e.is_cancelled() => {
                self.interrupt(session);
                TurnOutcome::Interrupted { steps }
            }
            Err(e) => {
                self.fail(session, &e);
                TurnOutcome::Failed {
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                    steps,
                }
            }
        };

        self.emit(
            session,
            |session_id, agent_id| AgentEvent::TurnFinish {
                session_id,
                agent_id,
                outcome: outcome.kind(),
                result: outcome.result_text().map(str::to_string),
                steps,
                last_usage,
                totals: session.tokens.clone(),
            },
        );
        outcome
    }

    fn begin(&self, session: &mut Session, input: TurnInput) -> Result<(), EngineError> {
        self.transition(TurnState::PreparingTurn);
        if session.status == SessionStatus::Archived {
            return Err(EngineError::SessionArchived(session.id.to_string()));
        }
        if let TurnInput::UserText(text) = input {
            session.step = 0;
            session.append(Message::user_text(text));
        }
        self.persist(session)
    }

    async fn drive(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        last_usage: &mut Option<TokenUsage>,
    ) -> Result<String, EngineError> {
        let max_steps = self.config.max_steps.max(1);
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if session.step >= max_steps {
                info!(max_steps, "step limit reached");
                return Ok(format!("Max steps {max_steps} reached"));
            }

            self.transition(TurnState::PreparingTurn);
            session.step += 1;
            let step = session.step;
            self.emit(session, |session_id, agent_id| AgentEvent::TurnStart {
                session_id,
                agent_id,
                step,
            });

            let tools = self.dispatcher.registry().definitions();
            self.maybe_compact(session, &tools, cancel).await?;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let notes = reminders::collect(session, self.context.config());
            let request = self.context.build(session, tools, &notes);

            self.transition(TurnState::AwaitingModel);
            let (message, finish_reason) = self.call_model(session, &request, cancel).await?;
            if let Some(usage) = &message.usage {
                session.tokens.accumulate(usage);
                *last_usage = Some(usage.clone());
            }
            let calls: Vec<ToolCallBlock> = message.tool_calls().into_iter().cloned().collect();
            let text = message.text_content();
            session.append(Message::Assistant(message));
            self.persist(session)?;

            if calls.is_empty() {
                if finish_reason != FinishReason::Stop {
                    warn!(finish_reason = finish_reason.as_str(), "model stopped without a natural end");
                }
                return Ok(text);
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            self.transition(TurnState::ExecutingTools);
            let ctx = self.tool_context(session, cancel);
            let dispatched = self.dispatcher.dispatch(&calls, &ctx).await;
            let mut submitted_plan = None;
            for call in dispatched {
                match &call.result.side_effect {
                    Some(SideEffect::PlanModeEntered) => session.mode = SessionMode::Plan,
                    Some(SideEffect::PlanSubmitted { plan }) => submitted_plan = Some(plan.clone()),
                    _ => {}
                }
                session.append(Message::tool_result(
                    call.tool_call_id,
                    call.result.content,
                    call.result.is_error,
                ));
            }
            self.persist(session)?;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            if let Some(plan) = submitted_plan {
                self.transition(TurnState::AwaitingPlanApproval);
                if !self.review_plan(session, &plan, cancel).await? {
                    return Ok(PLAN_REJECTED_RESULT.to_string());
                }
            }
        }
    }

    async fn call_model(
        &self,
        session: &Session,
        request: &LlmContext,
        cancel: &CancellationToken,
    ) -> Result<(AssistantMessage, FinishReason), EngineError> {
        let options = self.config.stream.to_options().with_cancel(cancel.clone());
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.provider.stream(request, &options) => result?,
        };

        let mut usage = None;
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
                event = stream.next() => event,
            };
            match event {
                Some(StreamEvent::TextDelta { delta }) => {
                    self.emit(session, |session_id, agent_id| AgentEvent::TextDelta {
                        session_id,
                        agent_id,
                        delta,
                    });
                }
                Some(StreamEvent::ThinkingDelta { delta }) => {
                    self.emit(session, |session_id, agent_id| AgentEvent::ThinkingDelta {
                        session_id,
                        agent_id,
                        delta,
                    });
                }
                Some(StreamEvent::Usage { usage: reported }) => usage = Some(reported),
                Some(StreamEvent::Retry {
                    attempt,
                    delay_ms,
                    error,
                    ..
                }) => {
                    // The failed attempt's output is superseded.
                    usage = None;
                    self.emit(session, |session_id, agent_id| AgentEvent::Retry {
                        session_id,
                        agent_id,
                        attempt,
                        delay_ms,
                        error: error.message,
                    });
                }
                Some(StreamEvent::Error { error }) => return Err(error.into()),
                Some(StreamEvent::Done {
                    mut message,
                    finish_reason,
                }) => {
                    if message.usage.is_none() {
                        message.usage = usage;
                    }
                    return Ok((message, finish_reason));
                }
                Some(_) => {}
                None => {
                    return Err(GatewayError::StreamInterrupted(
                        "stream ended without a final message".into(),
                    )
                    .into())
                }
            }
        }
    }

    async fn maybe_compact(
        &self,
        session: &mut Session,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if !self
            .context
            .needs_compaction(session, tools, self.provider.context_window())
        {
            return Ok(());
        }

        let tokens_before = session.message_token_estimate();
        self.emit(session, |session_id, agent_id| AgentEvent::CompactionStarted {
            session_id,
            agent_id,
            tokens_before,
        });

        let options = self.config.stream.to_options().with_cancel(cancel.clone());
        let keep = self.context.config().keep_recent_turns;
        let (tokens_after, removed_messages) = match compact(self.provider.as_ref(), session, keep, &options).await {
            Ok(Some(outcome)) => {
                self.persist(session)?;
                (outcome.tokens_after, outcome.removed_messages)
            }
            Ok(None) => (tokens_before, 0),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(error = %e, "compaction failed, continuing with full history");
                (tokens_before, 0)
            }
        };
        self.emit(session, |session_id, agent_id| AgentEvent::CompactionComplete {
            session_id,
            agent_id,
            tokens_before,
            tokens_after,
            removed_messages,
        });
        Ok(())
    }

    /// Suspend for the user's decision. Returns whether the loop continues.
    async fn review_plan(
        &self,
        session: &mut Session,
        plan: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        self.emit(session, |session_id, agent_id| AgentEvent::PlanApprovalRequested {
            session_id,
            agent_id,
            plan: plan.to_string(),
        });

        let decision = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            decision = self.approver.decide(&session.id, plan) => decision,
        };
        let approved = decision.is_approved();
        info!(approved, "plan decided");
        self.emit(session, |session_id, agent_id| AgentEvent::PlanDecided {
            session_id,
            agent_id,
            approved,
        });

        match decision {
            PlanDecision::Approved => {
                session.mode = SessionMode::Normal;
                session.append(Message::system(SystemKind::Notice, PLAN_APPROVED_NOTICE));
            }
            PlanDecision::Rejected { feedback } => {
                let notice = match feedback {
                    Some(feedback) => format!("{PLAN_REJECTED_NOTICE}\nFeedback: {feedback}"),
                    None => PLAN_REJECTED_NOTICE.to_string(),
                };
                session.append(Message::system(SystemKind::Notice, notice));
            }
        }
        self.persist(session)?;
        Ok(approved)
    }

    fn interrupt(&self, session: &mut Session) {
        self.transition(TurnState::Interrupted);
        for call in session.unresolved_tool_calls() {
            session.append(Message::tool_result(call.id, CANCELLED_CALL, true));
        }
        session.append(Message::system(SystemKind::Interrupted, INTERRUPTED_NOTICE));
        self.emit(session, |session_id, agent_id| AgentEvent::Interrupted { session_id, agent_id });
        if let Err(e) = self.persist(session) {
            error!(error = %e, "failed to persist interrupted session");
        }
        info!(steps = session.step, "turn interrupted");
    }

    fn fail(&self, session: &mut Session, err: &EngineError) {
        self.transition(TurnState::Failed);
        error!(error = %err, kind = err.kind(), "turn failed");
        for call in session.unresolved_tool_calls() {
            session.append(Message::tool_result(call.id, FAILED_CALL, true));
        }
        self.emit(session, |session_id, agent_id| AgentEvent::Error {
            session_id,
            agent_id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        if !matches!(err, EngineError::Store(_) | EngineError::SessionArchived(_)) {
            if let Err(e) = self.persist(session) {
                error!(error = %e, "failed to persist failed session");
            }
        }
    }

    fn tool_context(&self, session: &Session, cancel: &CancellationToken) -> ToolContext {
        ToolContext {
            session_id: session.id.clone(),
            agent_id: self.agent_id.clone(),
            parent_agent_id: self.parent_agent_id.clone(),
            working_directory: session.working_directory.clone(),
            mode: session.mode,
            files: session.files.clone(),
            todos: session.todos.clone(),
            abort_signal: cancel.clone(),
        }
    }

    fn persist(&self, session: &Session) -> Result<(), EngineError> {
        self.store.save(session)?;
        Ok(())
    }

    fn emit(
        &self,
        session: &Session,
        build: impl FnOnce(SessionId, AgentId) -> AgentEvent,
    ) {
        self.events.emit(build(session.id.clone(), self.agent_id.clone()));
    }

    fn transition(&self, next: TurnState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            warn!(from = ?*state, to = ?next, "unexpected turn state transition");
        }
        debug!(from = ?*state, to = ?next, "turn state");
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use loom_core::messages::SystemMessage;
    use loom_core::tools::Tool;
    use loom_llm::mock::{MockProvider, MockResponse};
    use loom_llm::{ReliableConfig, ReliableProvider};
    use loom_store::MemorySessionStore;
    use serde_json::json;
    use tokio::sync::broadcast;

    use crate::approval::AutoApprove;
    use crate::context::reminders::PLAN_MODE_REMINDER;
    use crate::subagent::SubagentManager;
    use crate::testing::{CallSpan, ScriptedTool};
    use crate::tools::task::TaskTool;
    use crate::tools::plan_mode::{EnterPlanModeTool, ExitPlanModeTool};

    struct Harness {
        engine: TurnEngine,
        provider: Arc<MockProvider>,
        store: Arc<MemorySessionStore>,
        rx: broadcast::Receiver<AgentEvent>,
    }

    fn harness(responses: Vec<MockResponse>, tools: Vec<Arc<dyn Tool>>, config: EngineConfig) -> Harness {
        harness_with(Arc::new(MockProvider::new(responses)), tools, config)
    }

    fn harness_with(provider: Arc<MockProvider>, tools: Vec<Arc<dyn Tool>>, config: EngineConfig) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let events = EventEmitter::new();
        let rx = events.subscribe();
        let engine = TurnEngine::new(
            provider.clone(),
            ToolRegistry::from_tools(tools).unwrap(),
            store.clone(),
            events,
            config,
        );
        Harness {
            engine,
            provider,
            store,
            rx,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn event_types(events: &[AgentEvent]) -> Vec<&'static str> {
        events.iter().map(AgentEvent::event_type).collect()
    }

    fn tool_results(session: &Session) -> Vec<(String, bool)> {
        session
            .messages
            .iter()
            .filter_map(|r| match &r.message {
                Message::ToolResult(t) => Some((t.text_content(), t.is_error)),
                _ => None,
            })
            .collect()
    }

    fn user(text: &str) -> TurnInput {
        TurnInput::UserText(text.into())
    }

    #[tokio::test]
    async fn text_reply_completes_the_turn() {
        let mut h = harness(vec![MockResponse::stream_text("All done.")], vec![], EngineConfig::default());
        let mut session = Session::new("/work");

        let outcome = h.engine.run(&mut session, user("hi"), &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                result: "All done.".into(),
                steps: 1
            }
        );
        assert_eq!(h.engine.state(), TurnState::Completed);
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.tokens.response_count, 1);

        let events = drain(&mut h.rx);
        let types = event_types(&events);
        assert_eq!(types.first(), Some(&"turn_start"));
        assert_eq!(types.last(), Some(&"turn_finish"));
        assert!(types.contains(&"text_delta"));
        assert!(events.iter().all(|e| e.session_id() == &session.id));
        assert!(events.iter().all(|e| e.agent_id() == h.engine.agent_id()));
        let Some(AgentEvent::TurnFinish { outcome, result, last_usage, .. }) = events.last() else {
            panic!("expected turn_finish");
        };
        assert_eq!(*outcome, OutcomeKind::Completed);
        assert_eq!(result.as_deref(), Some("All done."));
        assert!(last_usage.is_some());
    }

    #[tokio::test]
    async fn session_is_persisted_after_the_turn() {
        let h = harness(vec![MockResponse::stream_text("saved")], vec![], EngineConfig::default());
        let mut session = Session::new("/work");
        h.engine.run(&mut session, user("persist me"), &CancellationToken::new()).await;

        let loaded = h.store.load(&session.id).unwrap();
        assert_eq!(loaded.messages.len(), session.messages.len());
        assert_eq!(loaded.step, 1);
        assert_eq!(loaded.last_assistant_text().as_deref(), Some("saved"));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_results_follow_request_order() {
        let spans = Arc::new(parking_lot::Mutex::new(Vec::<CallSpan>::new()));
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(
                ScriptedTool::concurrent("Slow")
                    .with_delay(Duration::from_millis(50))
                    .with_spans(spans.clone()),
            ),
            Arc::new(
                ScriptedTool::concurrent("Fast")
                    .with_delay(Duration::from_millis(5))
                    .with_spans(spans.clone()),
            ),
            Arc::new(
                ScriptedTool::serial("Writer")
                    .with_delay(Duration::from_millis(10))
                    .with_spans(spans.clone()),
            ),
        ];
        let h = harness(
            vec![
                MockResponse::tool_calls(vec![
                    ("Slow", json!({"tag": "a"})),
                    ("Fast", json!({"tag": "b"})),
                    ("Writer", json!({"tag": "c"})),
                ]),
                MockResponse::stream_text("finished"),
            ],
            tools,
            EngineConfig::default(),
        );
        let mut session = Session::new("/work");

        let outcome = h.engine.run(&mut session, user("go"), &CancellationToken::new()).await;
        assert_eq!(outcome.result_text(), Some("finished"));
        assert_eq!(outcome.steps(), 2);

        assert_eq!(
            tool_results(&session),
            vec![
                ("Slow:a".to_string(), false),
                ("Fast:b".to_string(), false),
                ("Writer:c".to_string(), false),
            ]
        );

        // Each result answers the call in the same position.
        let Message::Assistant(assistant) = &session.messages[1].message else {
            panic!("expected assistant message");
        };
        let call_ids: Vec<_> = assistant.tool_calls().into_iter().map(|c| c.id.clone()).collect();
        let result_ids: Vec<_> = session.messages[2..5]
            .iter()
            .filter_map(|r| match &r.message {
                Message::ToolResult(t) => Some(t.tool_call_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(call_ids, result_ids);

        let spans = spans.lock();
        let writer = spans.iter().find(|s| s.name == "Writer").unwrap();
        assert!(spans
            .iter()
            .filter(|s| s.name != "Writer")
            .all(|s| !s.overlaps(writer)));

        let second = &h.provider.requests()[1];
        assert_eq!(
            second
                .messages
                .iter()
                .filter(|m| matches!(m, Message::ToolResult(_)))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn step_limit_completes_gracefully() {
        let tool = ScriptedTool::concurrent("Counter");
        let calls = tool.call_counter();
        let config = EngineConfig {
            max_steps: 2,
            ..Default::default()
        };
        let h = harness(
            vec![
                MockResponse::tool_calls(vec![("Counter", json!({}))]),
                MockResponse::tool_calls(vec![("Counter", json!({}))]),
                MockResponse::tool_calls(vec![("Counter", json!({}))]),
            ],
            vec![Arc::new(tool)],
            config,
        );
        let mut session = Session::new("/work");

        let outcome = h.engine.run(&mut session, user("loop forever"), &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                result: "Max steps 2 reached".into(),
                steps: 2
            }
        );
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sibling_tasks_run_one_after_another() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_calls(vec![
                ("Task", json!({"prompt": "edit module a", "description": "edit a"})),
                ("Task", json!({"prompt": "edit module b", "description": "edit b"})),
            ]),
            MockResponse::tool_calls(vec![("Slow", json!({"tag": "a"}))]),
            MockResponse::stream_text("a done"),
            MockResponse::tool_calls(vec![("Slow", json!({"tag": "b"}))]),
            MockResponse::stream_text("b done"),
            MockResponse::stream_text("parent done"),
        ]));
        let slow = ScriptedTool::serial("Slow").with_delay(Duration::from_millis(50));
        let spans = slow.spans();
        let manager = SubagentManager::new(
            provider.clone(),
            ToolRegistry::from_tools(vec![Arc::new(slow)]).unwrap(),
            Arc::new(MemorySessionStore::new()),
            EventEmitter::new(),
            EngineConfig::default(),
        );
        let h = harness_with(
            provider,
            vec![Arc::new(TaskTool::new(Arc::new(manager)))],
            EngineConfig::default(),
        );
        let engine = h.engine;

        // Spawning also requires the nested run to be Send.
        let (outcome, session) = tokio::spawn(async move {
            let mut session = Session::new("/work");
            let outcome = engine.run(&mut session, user("split the work"), &CancellationToken::new()).await;
            (outcome, session)
        })
        .await
        .unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { result: "parent done".into(), steps: 2 });
        assert_eq!(h.provider.call_count(), 6);
        let results = tool_results(&session);
        assert_eq!(results.len(), 2);
        assert!(results[0].0.starts_with("a done"), "{results:?}");
        assert!(results[1].0.starts_with("b done"), "{results:?}");
        assert!(results.iter().all(|(_, is_error)| !is_error));

        let spans: Vec<CallSpan> = spans.lock().clone();
        assert_eq!(spans.len(), 2);
        assert!(!spans[0].overlaps(&spans[1]), "child tools overlapped: {spans:?}");
    }

    #[tokio::test]
    async fn continue_keeps_the_step_budget_until_new_input() {
        let tool = ScriptedTool::concurrent("Counter");
        let config = EngineConfig {
            max_steps: 3,
            ..Default::default()
        };
        let h = harness(
            vec![
                MockResponse::tool_calls(vec![("Counter", json!({}))]),
                MockResponse::stream_text("first"),
                MockResponse::stream_text("second"),
                MockResponse::stream_text("third"),
            ],
            vec![Arc::new(tool)],
            config,
        );
        let mut session = Session::new("/work");
        let cancel = CancellationToken::new();

        let outcome = h.engine.run(&mut session, user("go"), &cancel).await;
        assert_eq!(outcome, TurnOutcome::Completed { result: "first".into(), steps: 2 });

        let outcome = h.engine.run(&mut session, TurnInput::Continue, &cancel).await;
        assert_eq!(outcome, TurnOutcome::Completed { result: "second".into(), steps: 3 });

        let outcome = h.engine.run(&mut session, TurnInput::Continue, &cancel).await;
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                result: "Max steps 3 reached".into(),
                steps: 3
            }
        );
        assert_eq!(h.provider.call_count(), 3);

        let outcome = h.engine.run(&mut session, user("again"), &cancel).await;
        assert_eq!(outcome, TurnOutcome::Completed { result: "third".into(), steps: 1 });
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let mut h = harness(vec![MockResponse::stream_text("unused")], vec![], EngineConfig::default());
        let mut session = Session::new("/work");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.engine.run(&mut session, user("hello"), &cancel).await;

        assert_eq!(outcome, TurnOutcome::Interrupted { steps: 0 });
        assert_eq!(h.provider.call_count(), 0);
        assert!(matches!(
            &session.messages.last().unwrap().message,
            Message::System(SystemMessage { kind: SystemKind::Interrupted, .. })
        ));
        let types = event_types(&drain(&mut h.rx));
        assert_eq!(types, vec!["interrupted", "turn_finish"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_streaming_dispatches_nothing() {
        let writer = ScriptedTool::serial("Writer");
        let calls = writer.call_counter();
        let MockResponse::Stream(mut events) = MockResponse::tool_calls(vec![("Writer", json!({"tag": "x"}))]) else {
            unreachable!()
        };
        events.pop();
        let h = harness(vec![MockResponse::Stall(events)], vec![Arc::new(writer)], EngineConfig::default());
        let mut session = Session::new("/work");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = h.engine.run(&mut session, user("write it"), &cancel).await;

        assert_eq!(outcome, TurnOutcome::Interrupted { steps: 1 });
        assert_eq!(h.engine.state(), TurnState::Interrupted);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(tool_results(&session).is_empty());
        let last = &session.messages.last().unwrap().message;
        assert_eq!(last.plain_text(), INTERRUPTED_NOTICE);
        assert!(session.unresolved_tool_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_batch_skips_remaining_calls() {
        let slow = ScriptedTool::serial("Slow").with_delay(Duration::from_secs(10));
        let writer = ScriptedTool::serial("Writer");
        let writer_calls = writer.call_counter();
        let mut h = harness(
            vec![MockResponse::tool_calls(vec![
                ("Slow", json!({})),
                ("Writer", json!({})),
            ])],
            vec![Arc::new(slow), Arc::new(writer)],
            EngineConfig::default(),
        );
        let mut session = Session::new("/work");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = h.engine.run(&mut session, user("go"), &cancel).await;

        assert_eq!(outcome, TurnOutcome::Interrupted { steps: 1 });
        assert_eq!(writer_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(
            tool_results(&session),
            vec![
                ("Cancelled".to_string(), true),
                ("Cancelled before execution".to_string(), true),
            ]
        );
        assert_eq!(h.provider.call_count(), 1);
        let types = event_types(&drain(&mut h.rx));
        assert_eq!(&types[types.len() - 2..], &["interrupted", "turn_finish"]);
    }

    #[tokio::test]
    async fn rejected_plan_keeps_plan_mode() {
        let mut h = harness(
            vec![MockResponse::tool_calls(vec![(
                "ExitPlanMode",
                json!({"plan": "1. Read the config\n2. Fix the bug"}),
            )])],
            vec![Arc::new(EnterPlanModeTool), Arc::new(ExitPlanModeTool)],
            EngineConfig::default(),
        );
        let mut session = Session::new("/work");
        session.mode = SessionMode::Plan;

        let outcome = h.engine.run(&mut session, user("plan the fix"), &CancellationToken::new()).await;

        assert_eq!(outcome.result_text(), Some(PLAN_REJECTED_RESULT));
        assert_eq!(outcome.kind(), OutcomeKind::Completed);
        assert_eq!(session.mode, SessionMode::Plan);
        assert_eq!(h.provider.call_count(), 1);

        let events = drain(&mut h.rx);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::PlanApprovalRequested { plan, .. } if plan.starts_with("1. Read")
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::PlanDecided { approved: false, .. })));
    }

    #[tokio::test]
    async fn approved_plan_resumes_in_normal_mode() {
        let h = harness(
            vec![
                MockResponse::tool_calls(vec![("EnterPlanMode", json!({}))]),
                MockResponse::tool_calls(vec![("ExitPlanMode", json!({"plan": "edit main.rs"}))]),
                MockResponse::stream_text("implemented"),
            ],
            vec![Arc::new(EnterPlanModeTool), Arc::new(ExitPlanModeTool)],
            EngineConfig::default(),
        );
        let engine = h.engine.with_approver(Arc::new(AutoApprove));
        let mut session = Session::new("/work");

        let outcome = engine.run(&mut session, user("do it carefully"), &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                result: "implemented".into(),
                steps: 3
            }
        );
        assert_eq!(session.mode, SessionMode::Normal);

        let requests = h.provider.requests();
        let reminder = requests[1].messages.last().unwrap();
        assert!(reminder.plain_text().contains(PLAN_MODE_REMINDER));
        assert!(requests[2]
            .messages
            .iter()
            .any(|m| m.plain_text() == PLAN_APPROVED_NOTICE));
    }

    #[tokio::test]
    async fn history_is_compacted_when_over_threshold() {
        let provider = Arc::new(
            MockProvider::new(vec![
                MockResponse::stream_text("Earlier: the user asked for four reports."),
                MockResponse::stream_text("ok"),
            ])
            .with_context_window(2_000),
        );
        let config = EngineConfig {
            context: ContextConfig {
                reserved_output_tokens: 0,
                keep_recent_turns: 1,
                compact_ratio: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut h = harness_with(provider, vec![], config);
        let mut session = Session::new("/work");
        for i in 0..4 {
            session.append(Message::user_text(format!("report {i}: {}", "data ".repeat(300))));
            session.append(Message::assistant_text(format!("summary {i}: {}", "text ".repeat(300))));
        }
        let before = session.message_token_estimate();

        let outcome = h.engine.run(&mut session, user("continue"), &CancellationToken::new()).await;
        assert_eq!(outcome.result_text(), Some("ok"));

        let events = drain(&mut h.rx);
        let Some(AgentEvent::CompactionComplete {
            tokens_before,
            tokens_after,
            removed_messages,
            ..
        }) = events
            .iter()
            .find(|e| matches!(e, AgentEvent::CompactionComplete { .. }))
        else {
            panic!("expected compaction_complete");
        };
        assert!(tokens_after < tokens_before);
        assert_eq!(*removed_messages, 8);
        assert!(session.message_token_estimate() < before);

        let active = session.active_messages();
        assert!(active[0].message.is_summary());
        assert_eq!(active[1].message.plain_text(), "continue");
        assert_eq!(active.len(), 3);

        let model_request = &h.provider.requests()[1];
        assert!(model_request.messages[0].is_summary());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_reported_as_events() {
        let mock = Arc::new(MockProvider::new(vec![
            MockResponse::Error(GatewayError::ProviderOverloaded),
            MockResponse::stream_text("after retry"),
        ]));
        let reliable = ReliableProvider::new(
            mock.clone(),
            ReliableConfig {
                base_delay: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let store = Arc::new(MemorySessionStore::new());
        let events = EventEmitter::new();
        let mut rx = events.subscribe();
        let engine = TurnEngine::new(
            Arc::new(reliable),
            ToolRegistry::default(),
            store,
            events,
            EngineConfig::default(),
        );
        let mut session = Session::new("/work");

        let outcome = engine.run(&mut session, user("hi"), &CancellationToken::new()).await;

        assert_eq!(outcome.result_text(), Some("after retry"));
        assert_eq!(mock.call_count(), 2);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Retry { delay_ms: 100, .. })));
    }

    #[tokio::test]
    async fn non_retryable_error_fails_and_session_stays_usable() {
        let mut h = harness(
            vec![
                MockResponse::Error(GatewayError::AuthenticationFailed("bad key".into())),
                MockResponse::stream_text("recovered"),
            ],
            vec![],
            EngineConfig::default(),
        );
        let mut session = Session::new("/work");

        let outcome = h.engine.run(&mut session, user("hi"), &CancellationToken::new()).await;
        let TurnOutcome::Failed { kind, steps, .. } = &outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(kind, GatewayError::AuthenticationFailed(String::new()).error_kind());
        assert_eq!(*steps, 1);
        let types = event_types(&drain(&mut h.rx));
        assert_eq!(&types[types.len() - 2..], &["error", "turn_finish"]);

        let outcome = h.engine.run(&mut session, TurnInput::Continue, &CancellationToken::new()).await;
        assert_eq!(outcome.result_text(), Some("recovered"));
    }

    #[tokio::test]
    async fn truncated_reply_still_completes() {
        let h = harness(
            vec![MockResponse::finished("partial answ", FinishReason::Length)],
            vec![],
            EngineConfig::default(),
        );
        let mut session = Session::new("/work");
        let outcome = h.engine.run(&mut session, user("long question"), &CancellationToken::new()).await;
        assert_eq!(outcome.result_text(), Some("partial answ"));
    }

    #[tokio::test]
    async fn archived_session_is_refused() {
        let h = harness(vec![], vec![], EngineConfig::default());
        let mut session = Session::new("/work");
        session.archive();

        let outcome = h.engine.run(&mut session, user("hi"), &CancellationToken::new()).await;
        assert!(matches!(outcome, TurnOutcome::Failed { ref kind, .. } if kind == "session_archived"));
        assert!(session.messages.is_empty());
        assert_eq!(h.provider.call_count(), 0);
    }

    #[test]
    fn state_machine_transitions() {
        use TurnState::*;
        assert!(Idle.can_transition_to(PreparingTurn));
        assert!(PreparingTurn.can_transition_to(AwaitingModel));
        assert!(AwaitingModel.can_transition_to(ExecutingTools));
        assert!(AwaitingModel.can_transition_to(Completed));
        assert!(ExecutingTools.can_transition_to(AwaitingPlanApproval));
        assert!(AwaitingPlanApproval.can_transition_to(PreparingTurn));
        assert!(AwaitingPlanApproval.can_transition_to(Completed));
        assert!(AwaitingModel.can_transition_to(Interrupted));
        assert!(ExecutingTools.can_transition_to(Failed));
        assert!(Completed.can_transition_to(PreparingTurn));

        assert!(!Idle.can_transition_to(ExecutingTools));
        assert!(!AwaitingModel.can_transition_to(AwaitingPlanApproval));
        assert!(!Completed.can_transition_to(Interrupted));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn config_deserializes_partially() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"max_steps": 7, "stream": {"max_tokens": 1024}, "dispatch": {"max_concurrency": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.max_steps, 7);
        assert_eq!(config.stream.to_options().max_tokens, Some(1024));
        assert_eq!(config.dispatch.max_concurrency, 2);
        assert_eq!(config.context.keep_recent_turns, 2);
    }
}
