use serde_json::{json, Value};

use crate::config::ProviderOptions;
use crate::types::{ConversationMessage, Role, ToolInfo};

/// Non-streaming request body.
pub fn build_chat_request(
    options: &ProviderOptions,
    messages: &[ConversationMessage],
    tools: &[ToolInfo],
) -> Value {
    prepared_params(
        options,
        convert_messages(options, messages),
        convert_tools(tools),
    )
}

/// Streaming request body; asks the server to append a usage chunk.
pub fn build_streaming_request(
    options: &ProviderOptions,
    messages: &[ConversationMessage],
    tools: &[ToolInfo],
) -> Value {
    let mut payload = build_chat_request(options, messages, tools);
    payload["stream"] = json!(true);
    payload["stream_options"] = json!({ "include_usage": true });
    payload
}

fn prepared_params(options: &ProviderOptions, messages: Vec<Value>, tools: Vec<Value>) -> Value {
    let mut payload = json!({
        "model": options.model.id,
        "messages": messages,
    });

    // Some routers reject an empty tool list outright.
    if !tools.is_empty() {
        payload["tools"] = Value::Array(tools);
    }

    let max_tokens = options.resolved_max_tokens();
    if options.model.can_reason {
        payload["max_completion_tokens"] = json!(max_tokens);
        if let Some(effort) = options.reasoning_effort() {
            payload["reasoning_effort"] = json!(effort.as_str());
        }
    } else {
        payload["max_tokens"] = json!(max_tokens);
    }

    for (key, value) in &options.config.extra_body {
        payload[key.as_str()] = value.clone();
    }

    payload
}

pub fn convert_messages(options: &ProviderOptions, messages: &[ConversationMessage]) -> Vec<Value> {
    let cache = options.cache_annotations_enabled();
    let mut converted = Vec::with_capacity(messages.len() + 1);
    converted.push(system_message(options, cache));

    let cache_from = messages.len().saturating_sub(2);
    for (index, message) in messages.iter().enumerate() {
        let cache_this = cache && index >= cache_from;
        match message.role {
            Role::User => converted.push(user_message(message, cache, cache_this)),
            Role::Assistant => {
                if let Some(assistant) = assistant_message(message, cache_this) {
                    converted.push(assistant);
                }
            }
            Role::Tool => {
                for result in &message.tool_results {
                    converted.push(json!({
                        "role": "tool",
                        "tool_call_id": result.tool_call_id,
                        "content": result.content,
                    }));
                }
            }
        }
    }

    converted
}

fn system_message(options: &ProviderOptions, cache: bool) -> Value {
    let text = match options.config.system_prompt_prefix.as_deref() {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}\n{}", options.system_message),
        _ => options.system_message.clone(),
    };

    if cache {
        return json!({
            "role": "system",
            "content": [{
                "type": "text",
                "text": text,
                "cache_control": { "type": "ephemeral" },
            }],
        });
    }
    json!({
        "role": "system",
        "content": text,
    })
}

fn user_message(message: &ConversationMessage, cache: bool, cache_this: bool) -> Value {
    if message.attachments.is_empty() && !cache {
        return json!({
            "role": "user",
            "content": message.content,
        });
    }

    let mut text_part = json!({
        "type": "text",
        "text": message.content,
    });
    if cache_this {
        text_part["cache_control"] = json!({ "type": "ephemeral" });
    }

    let mut parts = vec![text_part];
    parts.extend(message.attachments.iter().map(|attachment| {
        json!({
            "type": "image_url",
            "image_url": { "url": attachment.image_url() },
        })
    }));

    json!({
        "role": "user",
        "content": parts,
    })
}

/// Returns `None` for a vacuous turn. Interrupted (unfinished) tool calls are
/// never sent back: the model would see a call without a result.
fn assistant_message(message: &ConversationMessage, cache_this: bool) -> Option<Value> {
    let tool_calls = message
        .tool_calls
        .iter()
        .filter(|call| call.finished)
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.input,
                }
            })
        })
        .collect::<Vec<_>>();

    if message.content.is_empty() && tool_calls.is_empty() {
        return None;
    }

    let mut assistant = json!({ "role": "assistant" });
    if !message.content.is_empty() {
        assistant["content"] = json!(message.content);
    }
    if !tool_calls.is_empty() {
        assistant["tool_calls"] = Value::Array(tool_calls);
    }
    if cache_this {
        assistant["cache_control"] = json!({ "type": "ephemeral" });
    }
    Some(assistant)
}

pub fn convert_tools(tools: &[ToolInfo]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.schema(),
                }
            })
        })
        .collect()
}
