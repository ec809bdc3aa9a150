use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorCode, TributaryError};
use crate::tool_markup::extract_tool_calls;
use crate::types::{FinishReason, ProviderEvent, ProviderResponse, TokenUsage, ToolCall};
use crate::validation::parse_tool_arguments;
use crate::vendor::Vendor;

/// Tool calls under construction, addressed by the positional fragment index
/// until their id is known. Calls are only ever appended to.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
    by_index: HashMap<i64, usize>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one `delta.tool_calls[]` fragment in. Returns the call when the
    /// fragment started a new one.
    pub fn apply(&mut self, fragment: &Value) -> Option<ToolCall> {
        let mut index = fragment.get("index").and_then(Value::as_i64).unwrap_or(0);
        if index == -1 {
            index = 0;
        }
        let id = fragment.get("id").and_then(Value::as_str).unwrap_or("");
        let function = fragment.get("function");
        let name = function
            .and_then(|function| function.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let arguments = function
            .and_then(|function| function.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let Some(position) = self.by_index.get(&index).copied() else {
            return Some(self.start(index, id, name, arguments));
        };

        if id.is_empty() || self.calls[position].id == id {
            self.append(position, name, arguments);
            return None;
        }

        match self.calls.iter().position(|call| call.id == id) {
            Some(found) => {
                self.append(found, name, arguments);
                None
            }
            None => Some(self.start(index, id, name, arguments)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Marks every call finished, in creation order. Calls that never
    /// received a name are dropped.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter(|call| !call.name.is_empty())
            .map(|mut call| {
                call.finished = true;
                call
            })
            .collect()
    }

    fn start(&mut self, index: i64, id: &str, name: &str, arguments: &str) -> ToolCall {
        let id = if id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        let started = ToolCall::pending(id, name);
        let mut call = started.clone();
        call.input.push_str(arguments);

        self.by_index.insert(index, self.calls.len());
        self.calls.push(call);
        started
    }

    fn append(&mut self, position: usize, name: &str, arguments: &str) {
        let call = &mut self.calls[position];
        if call.name.is_empty() && !name.is_empty() {
            call.name = name.to_string();
        }
        call.input.push_str(arguments);
    }
}

/// Folds the chunks of one streamed attempt into a single turn.
///
/// A fresh aggregator is used for every attempt; nothing carries over a retry.
#[derive(Debug)]
pub struct StreamAggregator {
    vendor: Vendor,
    content: String,
    tool_calls: ToolCallAccumulator,
    finish_reason: Option<String>,
    usage: TokenUsage,
    saw_choice: bool,
}

impl StreamAggregator {
    pub fn new(vendor: Vendor) -> Self {
        Self {
            vendor,
            content: String::new(),
            tool_calls: ToolCallAccumulator::new(),
            finish_reason: None,
            usage: TokenUsage::default(),
            saw_choice: false,
        }
    }

    /// Applies one chunk and returns the events it produced, in order.
    pub fn apply_chunk(&mut self, chunk: &Value) -> Vec<ProviderEvent> {
        let mut events = Vec::new();

        if let Some(usage) = chunk.get("usage").filter(|usage| usage.is_object()) {
            self.usage = TokenUsage::from_openai(usage);
        }

        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            return events;
        };

        for choice in choices {
            self.saw_choice = true;

            if let Some(reason) = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .filter(|reason| !reason.is_empty())
            {
                self.finish_reason = Some(reason.to_string());
            }

            let Some(delta) = choice.get("delta") else {
                continue;
            };

            if let Some(thinking) = reasoning_text(delta) {
                events.push(ProviderEvent::ThinkingDelta { thinking });
            }

            if let Some(content) = delta
                .get("content")
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty())
            {
                self.content.push_str(content);
                events.push(ProviderEvent::ContentDelta {
                    content: content.to_string(),
                });
            }

            if let Some(fragments) = delta.get("tool_calls").and_then(Value::as_array) {
                for fragment in fragments {
                    if let Some(tool_call) = self.tool_calls.apply(fragment) {
                        events.push(ProviderEvent::ToolUseStart { tool_call });
                    }
                }
            }
        }

        events
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Closes the attempt after the stream ended without a transport error.
    pub fn finish(self) -> Result<ProviderResponse, TributaryError> {
        if !self.saw_choice {
            return Err(empty_response_error());
        }

        let reason = self.finish_reason.as_deref().unwrap_or("stop");
        let tool_calls = self.tool_calls.finish();
        Ok(finalize_turn(
            self.vendor,
            self.content,
            tool_calls,
            self.usage,
            reason,
        ))
    }
}

/// Builds a turn from a non-streaming chat-completions response body.
pub fn response_from_completion(
    vendor: Vendor,
    body: &Value,
) -> Result<ProviderResponse, TributaryError> {
    let Some(choice) = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return Err(empty_response_error());
    };

    let message = choice.get("message");
    let content = message
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut accumulator = ToolCallAccumulator::new();
    if let Some(calls) = message
        .and_then(|message| message.get("tool_calls"))
        .and_then(Value::as_array)
    {
        for (position, call) in calls.iter().enumerate() {
            if !call.is_object() {
                continue;
            }
            let mut fragment = call.clone();
            fragment["index"] = Value::from(position);
            accumulator.apply(&fragment);
        }
    }

    let reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty())
        .unwrap_or("stop");
    let usage = body
        .get("usage")
        .map(TokenUsage::from_openai)
        .unwrap_or_default();

    Ok(finalize_turn(
        vendor,
        content,
        accumulator.finish(),
        usage,
        reason,
    ))
}

fn finalize_turn(
    vendor: Vendor,
    content: String,
    mut tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    reason: &str,
) -> ProviderResponse {
    if tool_calls.is_empty() && vendor.embeds_tool_calls_in_text() && !content.is_empty() {
        tool_calls = extract_tool_calls(vendor, &content);
        if !tool_calls.is_empty() {
            debug!(
                vendor = ?vendor,
                count = tool_calls.len(),
                "recovered tool calls from response text"
            );
        }
    }

    for call in &mut tool_calls {
        if let Err(error) = parse_tool_arguments(call) {
            debug!(tool = call.name.as_str(), id = call.id.as_str(), "tool call arguments are malformed");
            call.error = Some(error);
        }
    }

    let mut finish_reason = FinishReason::from_openai(reason);
    if !tool_calls.is_empty() {
        finish_reason = FinishReason::ToolUse;
    }

    ProviderResponse {
        content,
        tool_calls,
        usage,
        finish_reason,
    }
}

/// Reasoning arrives on a side channel whose name differs between routers.
fn reasoning_text(delta: &Value) -> Option<String> {
    ["reasoning", "reasoning_content"]
        .iter()
        .filter_map(|key| delta.get(*key))
        .find_map(|value| match value {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            _ => None,
        })
}

fn empty_response_error() -> TributaryError {
    TributaryError::new(
        ErrorCode::EmptyResponse,
        "received empty response from chat completions endpoint; check endpoint configuration",
    )
}
