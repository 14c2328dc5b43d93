use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::files::FileTracker;
use crate::ids::{MessageId, SessionId, ToolCallId};
use crate::messages::{Message, ToolCallBlock};
use crate::tokens::{estimate_message_tokens, AccumulatedTokens};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Normal,
    Plan,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Plan => "plan",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Archived,
}

/// A message plus its bookkeeping. Only `deleted` changes after append.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub message: Message,
    pub token_estimate: u32,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(message: Message) -> Self {
        Self {
            id: MessageId::new(),
            token_estimate: estimate_message_tokens(&message),
            message,
            deleted: false,
            created_at: Utc::now(),
        }
    }
}

// --- Todos ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// Shared handle over a session's todo list. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct TodoList {
    inner: Arc<Mutex<Vec<TodoItem>>>,
}

impl TodoList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<TodoItem>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(items)),
        }
    }

    pub fn items(&self) -> Vec<TodoItem> {
        self.inner.lock().clone()
    }

    pub fn replace(&self, items: Vec<TodoItem>) {
        *self.inner.lock() = items;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn has_open_items(&self) -> bool {
        self.inner
            .lock()
            .iter()
            .any(|t| t.status != TodoStatus::Completed)
    }
}

impl PartialEq for TodoList {
    fn eq(&self, other: &Self) -> bool {
        self.items() == other.items()
    }
}

impl Serialize for TodoList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TodoList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<TodoItem>::deserialize(deserializer).map(Self::from_items)
    }
}

// --- Session ---

/// One persistent conversation. Messages are append-only; compaction only
/// flips `deleted` on superseded records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub status: SessionStatus,
    /// Iterations in the current run. Reset on new user input.
    #[serde(default)]
    pub step: u32,
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub todos: TodoList,
    #[serde(default)]
    pub files: FileTracker,
    #[serde(default)]
    pub tokens: AccumulatedTokens,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            working_directory: working_directory.into(),
            mode: SessionMode::Normal,
            status: SessionStatus::Active,
            step: 0,
            messages: Vec::new(),
            todos: TodoList::new(),
            files: FileTracker::new(),
            tokens: AccumulatedTokens::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn append(&mut self, message: Message) -> &MessageRecord {
        self.updated_at = Utc::now();
        let index = self.messages.len();
        self.messages.push(MessageRecord::new(message));
        &self.messages[index]
    }

    /// Flag the given records as superseded. Returns how many changed.
    pub fn soft_delete(&mut self, ids: &HashSet<MessageId>) -> usize {
        let mut changed = 0;
        for record in self.messages.iter_mut() {
            if !record.deleted && ids.contains(&record.id) {
                record.deleted = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Live records in presentation order: the compaction summary first, then
    /// everything else in append order.
    pub fn active_messages(&self) -> Vec<&MessageRecord> {
        let live = self.messages.iter().filter(|r| !r.deleted);
        let (summaries, rest): (Vec<_>, Vec<_>) = live.partition(|r| r.message.is_summary());
        summaries.into_iter().chain(rest).collect()
    }

    pub fn context_messages(&self) -> Vec<Message> {
        self.active_messages()
            .into_iter()
            .map(|r| r.message.clone())
            .collect()
    }

    pub fn message_token_estimate(&self) -> u32 {
        self.active_messages()
            .iter()
            .map(|r| r.token_estimate)
            .sum()
    }

    /// Text of the most recent assistant message, if any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages.iter().rev().find_map(|r| match &r.message {
            Message::Assistant(a) => Some(a.text_content()),
            _ => None,
        })
    }

    /// Tool calls in the latest assistant message that have no result yet.
    pub fn unresolved_tool_calls(&self) -> Vec<ToolCallBlock> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|r| matches!(r.message, Message::Assistant(_)))
        else {
            return Vec::new();
        };
        let Message::Assistant(assistant) = &self.messages[pos].message else {
            return Vec::new();
        };
        let answered: HashSet<&ToolCallId> = self.messages[pos + 1..]
            .iter()
            .filter_map(|r| match &r.message {
                Message::ToolResult(t) => Some(&t.tool_call_id),
                _ => None,
            })
            .collect();
        assistant
            .tool_calls()
            .into_iter()
            .filter(|tc| !answered.contains(&tc.id))
            .cloned()
            .collect()
    }

    pub fn archive(&mut self) {
        self.status = SessionStatus::Archived;
        self.updated_at = Utc::now();
    }
}
