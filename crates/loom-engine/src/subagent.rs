use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use loom_core::events::AgentEvent;
use loom_core::ids::{AgentId, SessionId};
use loom_core::provider::LlmProvider;
use loom_core::session::Session;
use loom_core::tools::ToolContext;
use loom_store::SessionStore;

use crate::engine::{EngineConfig, TurnEngine, TurnInput, TurnOutcome};
use crate::error::EngineError;
use crate::events::EventEmitter;
use crate::registry::{ToolFilter, ToolRegistry};

pub const GENERAL_PURPOSE: &str = "general-purpose";
pub const EXPLORE: &str = "explore";

/// A named sub-agent configuration. Profiles are plain data; every profile
/// runs through the same engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub tool_filter: ToolFilter,
    /// Overrides the engine's step budget for this profile.
    #[serde(default)]
    pub max_steps: Option<u32>,
}

/// Name-indexed profile table.
#[derive(Clone, Debug, Default)]
pub struct ProfileTable {
    profiles: BTreeMap<String, AgentProfile>,
}

impl ProfileTable {
    pub fn builtin() -> Self {
        Self::from_profiles(vec![
            AgentProfile {
                name: GENERAL_PURPOSE.into(),
                description: "Handles multi-step tasks autonomously with the full tool set.".into(),
                system_prompt: "You are a sub-agent working on a delegated task. Complete it, then \
                    reply with a concise report of what you did and what you found. Your reply is \
                    returned verbatim to the agent that delegated the task."
                    .into(),
                tool_filter: ToolFilter::InheritExcept(HashSet::from([
                    "EnterPlanMode".to_string(),
                    "ExitPlanMode".to_string(),
                ])),
                max_steps: None,
            },
            AgentProfile {
                name: EXPLORE.into(),
                description: "Searches and reads the codebase without modifying anything.".into(),
                system_prompt: "You are a read-only exploration sub-agent. Locate the files and code \
                    relevant to the question, then reply with precise paths, line numbers and a short \
                    explanation. You cannot modify files."
                    .into(),
                tool_filter: ToolFilter::Explicit(HashSet::from([
                    "Read".to_string(),
                    "Glob".to_string(),
                    "Grep".to_string(),
                ])),
                max_steps: Some(25),
            },
        ])
    }

    pub fn from_profiles(profiles: Vec<AgentProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProfile> {
        self.profiles.values()
    }
}

#[derive(Clone, Debug)]
pub struct SubagentOutcome {
    pub child_session_id: SessionId,
    pub child_agent_id: AgentId,
    pub outcome: TurnOutcome,
}

/// Runs sub-agents as child sessions with their own [`TurnEngine`].
///
/// Children draw tools from a leaf registry that has no `Task` tool, so they
/// cannot delegate further. Each child's cancellation token descends from the
/// invoking tool call's abort signal.
pub struct SubagentManager {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    store: Arc<dyn SessionStore>,
    events: EventEmitter,
    config: EngineConfig,
    profiles: ProfileTable,
    running: DashMap<AgentId, CancellationToken>,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        store: Arc<dyn SessionStore>,
        events: EventEmitter,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            events,
            config,
            profiles: ProfileTable::builtin(),
            running: DashMap::new(),
        }
    }

    pub fn with_profiles(mut self, profiles: ProfileTable) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    /// Run `prompt` under the named profile and wait for the child to finish.
    #[instrument(skip(self, prompt, parent), fields(session_id = %parent.session_id, profile = profile_name))]
    pub async fn run(
        &self,
        profile_name: &str,
        prompt: &str,
        parent: &ToolContext,
    ) -> Result<SubagentOutcome, EngineError> {
        let profile = self
            .profiles
            .get(profile_name)
            .ok_or_else(|| EngineError::UnknownProfile(profile_name.to_string()))?;

        let mut config = self.config.clone();
        if let Some(max_steps) = profile.max_steps {
            config.max_steps = max_steps;
        }
        let child_agent_id = AgentId::new();
        let engine = TurnEngine::new(
            Arc::clone(&self.provider),
            self.tools.filtered(&profile.tool_filter),
            Arc::clone(&self.store),
            self.events.clone(),
            config,
        )
        .with_profile_prompt(profile.system_prompt.clone())
        .with_agent_id(child_agent_id.clone(), Some(parent.agent_id.clone()));

        let mut session = Session::new(parent.working_directory.clone());
        let child_session_id = session.id.clone();
        let cancel = parent.abort_signal.child_token();
        self.running.insert(child_agent_id.clone(), cancel.clone());

        info!(child_session_id = %child_session_id, child_agent_id = %child_agent_id, "sub-agent spawned");
        self.events.emit(AgentEvent::SubagentSpawned {
            session_id: parent.session_id.clone(),
            agent_id: parent.agent_id.clone(),
            child_session_id: child_session_id.clone(),
            child_agent_id: child_agent_id.clone(),
            profile: profile.name.clone(),
        });

        let outcome = engine
            .run(&mut session, TurnInput::UserText(prompt.to_string()), &cancel)
            .await;
        self.running.remove(&child_agent_id);

        info!(child_agent_id = %child_agent_id, outcome = ?outcome.kind(), steps = outcome.steps(), "sub-agent finished");
        self.events.emit(AgentEvent::SubagentComplete {
            session_id: parent.session_id.clone(),
            agent_id: parent.agent_id.clone(),
            child_session_id: child_session_id.clone(),
            child_agent_id: child_agent_id.clone(),
            outcome: outcome.kind(),
        });

        Ok(SubagentOutcome {
            child_session_id,
            child_agent_id,
            outcome,
        })
    }

    /// Cancel one running child. Returns false if it is not running.
    pub fn cancel(&self, agent_id: &AgentId) -> bool {
        match self.running.remove(agent_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
        self.running.clear();
    }
}
