use std::collections::BTreeMap;

use serde_json::Value;

use loom_core::ids::ToolCallId;
use loom_core::messages::ToolCallBlock;
use loom_core::stream::StreamEvent;

struct PendingCall {
    id: ToolCallId,
    name: String,
    arguments: String,
    closed: bool,
}

/// Collects tool-call argument fragments keyed by the provider's per-call index.
///
/// Fragments are concatenated in arrival order. A call's arguments are only
/// interpreted when its block closes.
#[derive(Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<usize, PendingCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a call. Returns the start event the first time an index is seen;
    /// later sightings only fill in a missing id or name.
    pub fn open(&mut self, index: usize, id: Option<&str>, name: Option<&str>) -> Option<StreamEvent> {
        if let Some(call) = self.calls.get_mut(&index) {
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                if call.name.is_empty() {
                    call.name = name.to_string();
                }
            }
            return None;
        }

        let id = id
            .filter(|id| !id.is_empty())
            .map(ToolCallId::from_raw)
            .unwrap_or_default();
        let name = name.unwrap_or_default().to_string();
        self.calls.insert(
            index,
            PendingCall {
                id: id.clone(),
                name: name.clone(),
                arguments: String::new(),
                closed: false,
            },
        );
        Some(StreamEvent::ToolCallStart {
            index,
            tool_call_id: id,
            name,
        })
    }

    pub fn push(&mut self, index: usize, fragment: &str) -> Option<StreamEvent> {
        if fragment.is_empty() {
            return None;
        }
        let call = self.calls.get_mut(&index)?;
        call.arguments.push_str(fragment);
        Some(StreamEvent::ToolCallDelta {
            index,
            tool_call_id: call.id.clone(),
            arguments_delta: fragment.to_string(),
        })
    }

    pub fn close(&mut self, index: usize) -> Option<StreamEvent> {
        let call = self.calls.get_mut(&index)?;
        if call.closed {
            return None;
        }
        call.closed = true;
        Some(StreamEvent::ToolCallEnd {
            index,
            tool_call: block(call),
        })
    }

    /// Close every call still open, in index order.
    pub fn close_all(&mut self) -> Vec<StreamEvent> {
        let open: Vec<usize> = self
            .calls
            .iter()
            .filter(|(_, c)| !c.closed)
            .map(|(i, _)| *i)
            .collect();
        open.into_iter().filter_map(|i| self.close(i)).collect()
    }

    pub fn get(&self, index: usize) -> Option<ToolCallBlock> {
        self.calls.get(&index).map(block)
    }

    /// All calls in index order.
    pub fn calls(&self) -> Vec<ToolCallBlock> {
        self.calls.values().map(block).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

fn block(call: &PendingCall) -> ToolCallBlock {
    ToolCallBlock {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: parse_arguments(&call.arguments),
    }
}

/// Interpret a finished argument string. Empty means no arguments; anything
/// that is not valid JSON is kept verbatim as a string.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragments_concatenate_per_index() {
        let mut asm = ToolCallAssembler::new();
        assert!(asm.open(0, Some("call_a"), Some("Read")).is_some());
        assert!(asm.open(1, Some("call_b"), Some("Grep")).is_some());

        asm.push(0, "{\"file_");
        asm.push(1, "{\"pattern\":");
        asm.push(0, "path\":\"/a\"}");
        asm.push(1, "\"x\"}");

        let calls = asm.calls();
        assert_eq!(calls[0].arguments, json!({"file_path": "/a"}));
        assert_eq!(calls[1].arguments, json!({"pattern": "x"}));
    }

    #[test]
    fn malformed_arguments_kept_verbatim() {
        let mut asm = ToolCallAssembler::new();
        asm.open(0, Some("call_a"), Some("Write"));
        asm.push(0, "{\"file_path\": \"/a\", ");
        let Some(StreamEvent::ToolCallEnd { tool_call, .. }) = asm.close(0) else {
            panic!("expected ToolCallEnd");
        };
        assert_eq!(tool_call.arguments, json!("{\"file_path\": \"/a\", "));
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("  "), json!({}));
    }

    #[test]
    fn reopen_fills_missing_name_only() {
        let mut asm = ToolCallAssembler::new();
        asm.open(0, Some("call_a"), None);
        assert!(asm.open(0, None, Some("Bash")).is_none());
        assert_eq!(asm.get(0).unwrap().name, "Bash");
        assert_eq!(asm.get(0).unwrap().id.as_str(), "call_a");
    }

    #[test]
    fn close_all_skips_closed_calls() {
        let mut asm = ToolCallAssembler::new();
        asm.open(0, Some("a"), Some("Read"));
        asm.open(1, Some("b"), Some("Read"));
        asm.close(0);
        let events = asm.close_all();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::ToolCallEnd { index: 1, .. }));
        assert!(asm.close(1).is_none());
    }

    #[test]
    fn fragment_for_unknown_index_is_dropped() {
        let mut asm = ToolCallAssembler::new();
        assert!(asm.push(3, "{}").is_none());
        assert!(asm.is_empty());
    }
}
