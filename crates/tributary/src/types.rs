use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TributaryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Binary content attached to a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Attachment {
    Url {
        url: String,
    },
    Inline {
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Base64-encoded payload.
        data: String,
    },
}

impl Attachment {
    pub fn image_url(&self) -> String {
        match self {
            Attachment::Url { url } => url.clone(),
            Attachment::Inline { mime_type, data } => format!("data:{mime_type};base64,{data}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Serialized arguments, kept as text until the call is finished.
    pub input: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub finished: bool,
    /// Set when the finished arguments are not valid JSON. The rest of the
    /// turn is still delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TributaryError>,
}

impl ToolCall {
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input: String::new(),
            kind: "function".to_string(),
            finished: false,
            error: None,
        }
    }

    pub fn finished(id: impl Into<String>, name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input: input.into(),
            kind: "function".to_string(),
            finished: true,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// One entry of the conversation history handed to the request builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "toolCalls", default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "toolResults", default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn tool(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::with_role(Role::Tool, "")
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

/// A tool catalog entry. `parameters` holds the JSON schema `properties` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolInfo {
    pub fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": self.parameters,
            "required": self.required,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    #[serde(rename = "end_turn")]
    EndTurn,
    #[serde(rename = "max_tokens")]
    MaxTokens,
    #[serde(rename = "tool_use")]
    ToolUse,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FinishReason {
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::EndTurn,
            "length" => FinishReason::MaxTokens,
            "tool_calls" => FinishReason::ToolUse,
            _ => FinishReason::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::EndTurn => "end_turn",
            FinishReason::MaxTokens => "max_tokens",
            FinishReason::ToolUse => "tool_use",
            FinishReason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "cacheCreationTokens")]
    pub cache_creation_tokens: u64,
    #[serde(rename = "cacheReadTokens")]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Reads an OpenAI `usage` block. Cached prompt tokens are reported
    /// separately and excluded from `input_tokens`.
    pub fn from_openai(value: &Value) -> Self {
        let prompt_tokens = value
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = value
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let cached_tokens = value
            .get("prompt_tokens_details")
            .and_then(|details| details.get("cached_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Self {
            input_tokens: prompt_tokens.saturating_sub(cached_tokens),
            output_tokens: completion_tokens,
            cache_creation_tokens: 0,
            cache_read_tokens: cached_tokens,
        }
    }
}

/// A completed assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    #[serde(rename = "toolCalls")]
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    #[serde(rename = "finishReason")]
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderEvent {
    #[serde(rename = "content_delta")]
    ContentDelta { content: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "tool_use_start")]
    ToolUseStart {
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    #[serde(rename = "complete")]
    Complete { response: ProviderResponse },
    #[serde(rename = "error")]
    Error { error: TributaryError },
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderEvent::Complete { .. } | ProviderEvent::Error { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Minimal,
    Custom(String),
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Custom(value) => value.as_str(),
        }
    }
}

impl From<String> for ReasoningEffort {
    fn from(value: String) -> Self {
        match value.as_str() {
            "low" => ReasoningEffort::Low,
            "medium" => ReasoningEffort::Medium,
            "high" => ReasoningEffort::High,
            "minimal" => ReasoningEffort::Minimal,
            _ => ReasoningEffort::Custom(value),
        }
    }
}

impl From<ReasoningEffort> for String {
    fn from(value: ReasoningEffort) -> Self {
        value.as_str().to_string()
    }
}

/// Capabilities of the target model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "canReason", default)]
    pub can_reason: bool,
    #[serde(rename = "defaultMaxTokens")]
    pub default_max_tokens: u32,
}
