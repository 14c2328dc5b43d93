use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use loom_core::tools::{ConcurrencyPolicy, Tool, ToolDefinition};

use crate::error::EngineError;

/// Static capabilities of a registered tool, read by the dispatcher before it
/// schedules a call.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub policy: ConcurrencyPolicy,
    pub has_side_effects: bool,
    pub plan_safe: bool,
}

impl ToolDescriptor {
    fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
            policy: tool.concurrency_policy(),
            has_side_effects: tool.has_side_effects(),
            plan_safe: tool.allowed_in_plan_mode(),
        }
    }
}

/// Filter for selecting tools when creating sub-agent registries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tools", rename_all = "snake_case")]
pub enum ToolFilter {
    /// Same tools as parent.
    InheritAll,
    /// Parent tools minus these.
    InheritExcept(HashSet<String>),
    /// Only these tools.
    Explicit(HashSet<String>),
}

impl ToolFilter {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::InheritAll => true,
            Self::InheritExcept(excluded) => !excluded.contains(name),
            Self::Explicit(included) => included.contains(name),
        }
    }
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
}

/// Immutable name-indexed tool table, built once at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, ToolEntry>>,
}

impl ToolRegistry {
    /// Build the table from an explicit list. Names must be unique.
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Result<Self, EngineError> {
        let mut table = BTreeMap::new();
        for tool in tools {
            let descriptor = ToolDescriptor::of(tool.as_ref());
            let name = descriptor.name.clone();
            if table.contains_key(&name) {
                return Err(EngineError::DuplicateTool(name));
            }
            table.insert(name, ToolEntry { tool, descriptor });
        }
        Ok(Self {
            tools: Arc::new(table),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|e| &e.descriptor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|e| ToolDefinition {
                name: e.descriptor.name.clone(),
                description: e.descriptor.description.clone(),
                parameters: e.descriptor.parameters.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Create a filtered copy for a sub-agent.
    pub fn filtered(&self, filter: &ToolFilter) -> Self {
        let table = self
            .tools
            .iter()
            .filter(|(name, _)| filter.allows(name))
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ToolEntry {
                        tool: Arc::clone(&entry.tool),
                        descriptor: entry.descriptor.clone(),
                    },
                )
            })
            .collect();
        Self {
            tools: Arc::new(table),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
