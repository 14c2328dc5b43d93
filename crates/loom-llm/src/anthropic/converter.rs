use serde_json::{json, Value};

use loom_core::context::LlmContext;
use loom_core::messages::{
    AssistantContent, AssistantMessage, Message, ToolCallBlock, ToolResultMessage, UserContent,
    UserMessage,
};
use loom_core::provider::{StreamOptions, ThinkingConfig};

/// Convert a full [`LlmContext`] into the Anthropic Messages request body.
pub fn build_request_body(
    context: &LlmContext,
    options: &StreamOptions,
    model: &str,
    default_max_tokens: u32,
) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "max_tokens": options.max_tokens.unwrap_or(default_max_tokens),
    });

    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }
    if !options.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(options.stop_sequences);
    }
    if let ThinkingConfig::Budget { tokens } = &options.thinking {
        body["thinking"] = json!({"type": "enabled", "budget_tokens": tokens});
    }

    let system: Vec<Value> = context
        .system_blocks
        .iter()
        .map(|b| json!({"type": "text", "text": b.content}))
        .collect();
    if !system.is_empty() {
        body["system"] = json!(system);
    }

    body["messages"] = json!(convert_messages(&context.messages));

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Convert messages to Anthropic's alternating user/assistant format.
///
/// Engine-authored system messages travel as user text. Consecutive messages
/// that land on the same role are merged into one.
pub fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut result: Vec<Value> = Vec::new();

    for msg in messages {
        let (role, blocks) = match msg {
            Message::System(s) => ("user", vec![json!({"type": "text", "text": s.prompt_text()})]),
            Message::User(user) => ("user", convert_user_content(user)),
            Message::Assistant(asst) => ("assistant", convert_assistant_content(asst)),
            Message::ToolResult(tr) => ("user", vec![convert_tool_result(tr)]),
        };
        if blocks.is_empty() {
            continue;
        }

        match result.last_mut() {
            Some(prev) if prev["role"] == role => {
                if let Some(content) = prev["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => result.push(json!({"role": role, "content": blocks})),
        }
    }

    // Cache breakpoint on the newest user content.
    if let Some(last_user) = result.iter_mut().rev().find(|m| m["role"] == "user") {
        if let Some(block) = last_user["content"].as_array_mut().and_then(|c| c.last_mut()) {
            block["cache_control"] = json!({"type": "ephemeral"});
        }
    }

    result
}

fn convert_user_content(msg: &UserMessage) -> Vec<Value> {
    msg.content
        .iter()
        .map(|c| match c {
            UserContent::Text { text } => json!({"type": "text", "text": text}),
            UserContent::Image { mime_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data}
            }),
        })
        .collect()
}

fn convert_assistant_content(msg: &AssistantMessage) -> Vec<Value> {
    msg.content
        .iter()
        .filter_map(|c| match c {
            AssistantContent::Text { text } if text.is_empty() => None,
            AssistantContent::Text { text } => Some(json!({"type": "text", "text": text})),
            // Unsigned thinking cannot be replayed.
            AssistantContent::Thinking { text, signature } => signature.as_ref().map(|sig| {
                json!({
                    "type": "thinking",
                    "thinking": text,
                    "signature": sig,
                })
            }),
            AssistantContent::ToolCall(tc) => Some(convert_tool_call(tc)),
        })
        .collect()
}

fn convert_tool_call(tc: &ToolCallBlock) -> Value {
    // The API requires an object; malformed arguments were already answered
    // with an error result, so replay them as an empty input.
    let input = if tc.arguments.is_object() {
        tc.arguments.clone()
    } else {
        json!({})
    };
    json!({
        "type": "tool_use",
        "id": remap_tool_call_id(tc.id.as_str()),
        "name": tc.name,
        "input": input,
    })
}

fn convert_tool_result(msg: &ToolResultMessage) -> Value {
    let mut block = json!({
        "type": "tool_result",
        "tool_use_id": remap_tool_call_id(msg.tool_call_id.as_str()),
        "content": [{"type": "text", "text": msg.text_content()}],
    });
    if msg.is_error {
        block["is_error"] = json!(true);
    }
    block
}

/// Remap tool call IDs from OpenAI format (`call_*`) to Anthropic format
/// (`toolu_remap_*`). Anything else passes through unchanged.
pub fn remap_tool_call_id(id: &str) -> String {
    if let Some(suffix) = id.strip_prefix("call_") {
        format!("toolu_remap_{suffix}")
    } else {
        id.to_string()
    }
}
