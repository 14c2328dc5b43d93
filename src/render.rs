//! Terminal rendering of engine events and interactive plan approval.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use loom_core::events::AgentEvent;
use loom_core::ids::AgentId;
use loom_engine::{ApprovalRequest, PlanDecision};

const PREVIEW_CHARS: usize = 200;

/// Print events until the root agent's `TurnFinish` arrives or the channel closes.
///
/// Only the root agent's text is streamed to stdout; everything else goes to
/// stderr so stdout stays pipeable.
pub async fn render_events(mut rx: broadcast::Receiver<AgentEvent>, root: AgentId, json: bool) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event renderer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let finished = matches!(&event, AgentEvent::TurnFinish { agent_id, .. } if *agent_id == root);
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        } else {
            render_text(&event, &root);
        }
        if finished {
            break;
        }
    }
}

fn render_text(event: &AgentEvent, root: &AgentId) {
    match event {
        AgentEvent::TextDelta { agent_id, delta, .. } if agent_id == root => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::ToolCallStart { agent_id, tool_name, arguments, .. } => {
            let marker = if agent_id == root { "" } else { "  " };
            eprintln!("\n{marker}> {tool_name} {}", preview(&arguments.to_string()));
        }
        AgentEvent::ToolCallResult { tool_name, is_error: true, result_preview, .. } => {
            eprintln!("  ! {tool_name} failed: {}", preview(result_preview));
        }
        AgentEvent::ToolCallResult { tool_name, truncated: true, .. } => {
            eprintln!("  {tool_name}: output truncated");
        }
        AgentEvent::Retry { attempt, delay_ms, error, .. } => {
            eprintln!("\n[retry {attempt} in {delay_ms}ms: {error}]");
        }
        AgentEvent::CompactionComplete { tokens_before, tokens_after, removed_messages, .. }
            if *removed_messages > 0 =>
        {
            eprintln!("\n[compacted {removed_messages} messages: {tokens_before} -> {tokens_after} tokens]");
        }
        AgentEvent::SubagentSpawned { profile, child_session_id, .. } => {
            eprintln!("\n[sub-agent {profile} started: {child_session_id}]");
        }
        AgentEvent::SubagentComplete { child_session_id, outcome, .. } => {
            eprintln!("[sub-agent {child_session_id} finished: {outcome:?}]");
        }
        AgentEvent::Interrupted { agent_id, .. } if agent_id == root => {
            eprintln!("\n[interrupted]");
        }
        AgentEvent::Error { agent_id, kind, message, .. } if agent_id == root => {
            eprintln!("\n[error {kind}: {message}]");
        }
        _ => {}
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{head}...")
}

/// Answer plan approval requests from stdin.
///
/// `y`/`yes` approves. Anything else rejects; a reply other than `n`/`no`
/// is passed back as feedback.
pub async fn answer_approvals(mut requests: mpsc::Receiver<ApprovalRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(request) = requests.recv().await {
        eprintln!("\n--- proposed plan ---\n{}\n---------------------", request.plan);
        eprint!("Approve plan? [y/N or feedback] ");
        let answer = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => String::new(),
        };
        let _ = request.reply.send(parse_decision(&answer));
    }
}

fn parse_decision(answer: &str) -> PlanDecision {
    let answer = answer.trim();
    match answer.to_ascii_lowercase().as_str() {
        "y" | "yes" => PlanDecision::Approved,
        "" | "n" | "no" => PlanDecision::Rejected { feedback: None },
        _ => PlanDecision::Rejected { feedback: Some(answer.to_string()) },
    }
}
