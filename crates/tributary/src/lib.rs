//! Streaming chat-completion aggregation with retry and tool-call recovery.

mod abort;
mod aggregator;
mod config;
mod error;
mod event_stream;
mod metrics;
mod provider;
mod request;
mod retry;
mod sse;
mod tool_markup;
mod transport;
mod types;
mod validation;
mod vendor;

pub use abort::{AbortController, AbortSignal};
pub use aggregator::{response_from_completion, StreamAggregator, ToolCallAccumulator};
pub use config::{
    load_provider_config, parse_provider_config, CredentialResolver, CredentialResolverRef,
    EnvCredentialResolver, ModelSettings, ModelSettingsByType, ModelType, ProviderConfig,
    ProviderOptions, DEFAULT_MAX_RETRIES,
};
pub use error::{ErrorCode, TributaryError};
pub use event_stream::{EventStream, ProviderEventStream, ProviderResult};
pub use metrics::ExecutionMetrics;
pub use provider::ChatProvider;
pub use request::{build_chat_request, build_streaming_request, convert_messages, convert_tools};
pub use retry::{
    backoff_delay_ms, parse_retry_after_ms, RetryController, RetryDecision,
    DEFAULT_BASE_BACKOFF_MS,
};
pub use sse::SseDecoder;
pub use tool_markup::{
    extract_tool_calls, parse_inline_tag_calls, parse_key_value_blocks,
    repair_multi_edit_arguments,
};
pub use transport::{
    decode_sse_chunks, http_transport_factory, ChatTransport, ChatTransportRef, ChunkStream,
    HttpTransport, TransportFactory, TransportFuture,
};
pub use types::{
    Attachment, ConversationMessage, FinishReason, Model, ProviderEvent, ProviderResponse,
    ReasoningEffort, Role, TokenUsage, ToolCall, ToolInfo, ToolResult,
};
pub use validation::{parse_tool_arguments, validate_tool_call};
pub use vendor::{is_local_endpoint, is_loopback_base_url, supports_cache_annotations, Vendor};
