//! Transient notes injected into the next request only.

use std::fmt::Write as _;

use loom_core::session::{Session, SessionMode};

use super::ContextConfig;

pub const PLAN_MODE_REMINDER: &str = "Plan mode is active. Only read-only tools are available. \
Explore, then present the plan with ExitPlanMode and wait for approval.";

pub const EMPTY_TODOS_REMINDER: &str = "The todo list is empty. If this task has several steps, \
track them with TodoWrite.";

/// Reminders pending for the current step, in a stable order.
pub fn collect(session: &Session, config: &ContextConfig) -> Vec<String> {
    let mut reminders = Vec::new();

    if session.mode == SessionMode::Plan {
        reminders.push(PLAN_MODE_REMINDER.to_string());
    }

    let changed = session.files.changed_files();
    if !changed.is_empty() {
        let mut text = String::from(
            "These files changed outside this session since they were last read. Read them again before modifying them:",
        );
        for path in &changed {
            let _ = write!(text, "\n- {}", path.display());
        }
        reminders.push(text);
    }

    if session.step == config.todo_reminder_step && session.todos.is_empty() {
        reminders.push(EMPTY_TODOS_REMINDER.to_string());
    }

    reminders
}
