use serde_json::{json, Value};

use loom_core::context::LlmContext;
use loom_core::messages::{AssistantContent, AssistantMessage, Message, UserContent, UserMessage};
use loom_core::provider::{StreamOptions, ThinkingConfig};

/// Convert a full [`LlmContext`] into a Chat Completions request body.
pub fn build_request_body(
    context: &LlmContext,
    options: &StreamOptions,
    model: &str,
    default_max_tokens: u32,
) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "stream_options": {"include_usage": true},
        "max_completion_tokens": options.max_tokens.unwrap_or(default_max_tokens),
        "messages": convert_messages(context),
    });

    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }
    if !options.stop_sequences.is_empty() {
        body["stop"] = json!(options.stop_sequences);
    }
    if let ThinkingConfig::Budget { tokens } = &options.thinking {
        body["reasoning_effort"] = json!(reasoning_effort(*tokens));
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

fn reasoning_effort(budget: u32) -> &'static str {
    match budget {
        0..=4_096 => "low",
        4_097..=16_384 => "medium",
        _ => "high",
    }
}

pub fn convert_messages(context: &LlmContext) -> Vec<Value> {
    let mut result = Vec::with_capacity(context.messages.len() + 1);

    let system = context.system_prompt();
    if !system.is_empty() {
        result.push(json!({"role": "system", "content": system}));
    }

    for msg in &context.messages {
        match msg {
            Message::System(s) => result.push(json!({"role": "user", "content": s.prompt_text()})),
            Message::User(user) => result.push(convert_user(user)),
            Message::Assistant(asst) => result.push(convert_assistant(asst)),
            Message::ToolResult(tr) => {
                let text = tr.text_content();
                let content = if tr.is_error {
                    format!("[error] {text}")
                } else {
                    text
                };
                result.push(json!({
                    "role": "tool",
                    "tool_call_id": tr.tool_call_id.as_str(),
                    "content": content,
                }));
            }
        }
    }

    result
}

fn convert_user(msg: &UserMessage) -> Value {
    let parts: Vec<Value> = msg
        .content
        .iter()
        .map(|c| match c {
            UserContent::Text { text } => json!({"type": "text", "text": text}),
            UserContent::Image { mime_type, data } => json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{mime_type};base64,{data}")}
            }),
        })
        .collect();
    json!({"role": "user", "content": parts})
}

fn convert_assistant(msg: &AssistantMessage) -> Value {
    let mut value = json!({"role": "assistant"});
    let text = msg.text_content();
    value["content"] = if text.is_empty() { Value::Null } else { json!(text) };

    let calls: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|c| match c {
            AssistantContent::ToolCall(tc) => Some(json!({
                "id": tc.id.as_str(),
                "type": "function",
                "function": {
                    "name": tc.name,
                    "arguments": arguments_string(&tc.arguments),
                },
            })),
            _ => None,
        })
        .collect();
    if !calls.is_empty() {
        value["tool_calls"] = json!(calls);
    }
    value
}

/// Arguments go over the wire as a JSON string. Raw text kept from a
/// malformed stream is replayed unchanged.
fn arguments_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}
