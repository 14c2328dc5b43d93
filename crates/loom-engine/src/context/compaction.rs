//! History compaction: the oldest turns are folded into one summary message.
//!
//! Retained history is always a suffix of the live messages plus a single
//! summary, and the result is applied only when it is strictly smaller than
//! what it replaces.

use std::collections::HashSet;
use std::fmt::Write as _;

use futures::StreamExt;
use tracing::{info, instrument};

use loom_core::context::{LlmContext, SystemBlock, SystemBlockLabel};
use loom_core::errors::GatewayError;
use loom_core::ids::MessageId;
use loom_core::messages::{Message, SystemKind};
use loom_core::provider::{LlmProvider, StreamOptions};
use loom_core::session::{MessageRecord, Session};
use loom_core::stream::StreamEvent;
use loom_core::tokens::estimate_message_tokens;

use crate::error::EngineError;

const SUMMARY_PROMPT: &str = include_str!("../../prompts/summarize.txt");
const MAX_ENTRY_CHARS: usize = 4000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub removed_messages: usize,
}

/// Index into the active view where the retained suffix begins: the start of
/// the `keep`-th most recent user turn. Splitting at user input keeps every
/// tool call next to its result.
fn split_point(active: &[&MessageRecord], keep: usize) -> Option<usize> {
    let keep = keep.max(1);
    let user_turns: Vec<usize> = active
        .iter()
        .enumerate()
        .filter(|(_, r)| r.message.is_user_input())
        .map(|(i, _)| i)
        .collect();
    if user_turns.len() < keep {
        return None;
    }
    let split = user_turns[user_turns.len() - keep];
    if active[..split].iter().all(|r| r.message.is_summary()) {
        return None;
    }
    Some(split)
}

fn transcript(prefix: &[&MessageRecord]) -> String {
    let mut out = String::new();
    for record in prefix {
        let label = match &record.message {
            Message::System(s) if s.kind == SystemKind::Summary => "Earlier summary",
            Message::System(_) => "Note",
            Message::User(_) => "User",
            Message::Assistant(_) => "Assistant",
            Message::ToolResult(_) => "Tool result",
        };
        let text = record.message.plain_text();
        let shown: String = text.chars().take(MAX_ENTRY_CHARS).collect();
        let cut = if shown.len() < text.len() { "\n[...]" } else { "" };
        let _ = write!(out, "[{label}]\n{shown}{cut}\n\n");
    }
    out
}

async fn request_summary(
    provider: &dyn LlmProvider,
    context: &LlmContext,
    options: &StreamOptions,
) -> Result<String, EngineError> {
    let mut stream = provider.stream(context, options).await?;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Done { message, .. } => return Ok(message.text_content()),
            StreamEvent::Error { error } => return Err(error.into()),
            _ => {}
        }
    }
    Err(GatewayError::StreamInterrupted("summary stream ended without a final message".into()).into())
}

/// Summarize everything before the most recent `keep_recent_turns` user turns.
///
/// Returns `Ok(None)` when there is nothing to fold or when the summary would
/// not shrink the history. The session is only modified on success.
#[instrument(skip_all, fields(session_id = %session.id, keep_recent_turns))]
pub async fn compact(
    provider: &dyn LlmProvider,
    session: &mut Session,
    keep_recent_turns: usize,
    options: &StreamOptions,
) -> Result<Option<CompactionOutcome>, EngineError> {
    let active = session.active_messages();
    let Some(split) = split_point(&active, keep_recent_turns) else {
        info!("nothing to compact");
        return Ok(None);
    };
    let (prefix, suffix) = active.split_at(split);

    let tokens_before: u32 = active.iter().map(|r| r.token_estimate).sum();
    let retained: u32 = suffix.iter().map(|r| r.token_estimate).sum();
    let prefix_ids: HashSet<MessageId> = prefix.iter().map(|r| r.id.clone()).collect();

    let request = LlmContext {
        messages: vec![Message::user_text(format!(
            "Summarize the conversation so far.\n\n{}",
            transcript(prefix)
        ))],
        system_blocks: vec![SystemBlock::new(
            SystemBlockLabel::Custom("summarizer".into()),
            SUMMARY_PROMPT.trim_end(),
        )],
        tools: Vec::new(),
        working_directory: session.working_directory.clone(),
    };

    let summary_text = request_summary(provider, &request, options).await?;
    let summary = Message::system(SystemKind::Summary, summary_text.trim());
    let tokens_after = retained.saturating_add(estimate_message_tokens(&summary));
    if tokens_after >= tokens_before {
        info!(tokens_before, tokens_after, "summary would not shrink history, skipping");
        return Ok(None);
    }

    let removed_messages = session.soft_delete(&prefix_ids);
    session.append(summary);
    info!(tokens_before, tokens_after, removed_messages, "history compacted");
    Ok(Some(CompactionOutcome {
        tokens_before,
        tokens_after,
        removed_messages,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_llm::mock::{MockProvider, MockResponse};

    fn long_session(turns: usize) -> Session {
        let mut session = Session::new("/work");
        for i in 0..turns {
            session.append(Message::user_text(format!("request {i}: {}", "detail ".repeat(200))));
            session.append(Message::assistant_text(format!("answer {i}: {}", "result ".repeat(200))));
        }
        session
    }

    fn live_ids(session: &Session) -> Vec<MessageId> {
        session.active_messages().iter().map(|r| r.id.clone()).collect()
    }

    #[tokio::test]
    async fn keeps_recent_suffix_plus_one_summary() {
        let mut session = long_session(4);
        let before_ids = live_ids(&session);
        let before_estimate = session.message_token_estimate();
        let provider = MockProvider::new(vec![MockResponse::stream_text("The user asked for four things.")]);

        let outcome = compact(&provider, &mut session, 2, &StreamOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.removed_messages, 4);
        assert_eq!(outcome.tokens_before, before_estimate);
        assert!(outcome.tokens_after < outcome.tokens_before);
        assert!(session.message_token_estimate() < before_estimate);

        let active = session.active_messages();
        assert_eq!(active.len(), 5);
        assert!(active[0].message.is_summary());
        assert_eq!(active.iter().filter(|r| r.message.is_summary()).count(), 1);
        let retained: Vec<MessageId> = active[1..].iter().map(|r| r.id.clone()).collect();
        assert_eq!(retained, before_ids[before_ids.len() - 4..].to_vec());

        // Storage keeps every record; only flags changed.
        assert_eq!(session.messages.len(), 9);
        assert_eq!(session.messages.iter().filter(|r| r.deleted).count(), 4);
    }

    #[tokio::test]
    async fn second_compaction_folds_previous_summary() {
        let mut session = long_session(3);
        let provider = MockProvider::new(vec![
            MockResponse::stream_text("first summary"),
            MockResponse::stream_text("second summary"),
        ]);
        compact(&provider, &mut session, 1, &StreamOptions::default()).await.unwrap().unwrap();
        session.append(Message::user_text(format!("more: {}", "x".repeat(800))));
        session.append(Message::assistant_text("ok"));

        compact(&provider, &mut session, 1, &StreamOptions::default()).await.unwrap().unwrap();
        let active = session.active_messages();
        assert_eq!(active.iter().filter(|r| r.message.is_summary()).count(), 1);
        assert_eq!(active[0].message.plain_text(), "second summary");

        let request = &provider.requests()[1];
        assert!(request.messages[0].plain_text().contains("[Earlier summary]\nfirst summary"));
    }

    #[tokio::test]
    async fn oversized_summary_is_discarded() {
        let mut session = long_session(3);
        let before = session.message_token_estimate();
        let provider = MockProvider::new(vec![MockResponse::stream_text(&"verbose ".repeat(2000))]);

        let outcome = compact(&provider, &mut session, 1, &StreamOptions::default()).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(session.message_token_estimate(), before);
        assert!(session.messages.iter().all(|r| !r.deleted));
    }

    #[tokio::test]
    async fn too_few_turns_is_a_no_op() {
        let mut session = long_session(2);
        let provider = MockProvider::new(vec![]);
        let outcome = compact(&provider, &mut session, 2, &StreamOptions::default()).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn provider_failure_leaves_session_untouched() {
        let mut session = long_session(3);
        let provider = MockProvider::new(vec![MockResponse::stream_error(GatewayError::ProviderOverloaded)]);
        let result = compact(&provider, &mut session, 1, &StreamOptions::default()).await;
        assert!(matches!(result, Err(EngineError::Gateway(GatewayError::ProviderOverloaded))));
        assert_eq!(session.messages.len(), 6);
        assert!(session.messages.iter().all(|r| !r.deleted));
    }
}
