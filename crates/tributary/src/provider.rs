use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::aggregator::{response_from_completion, StreamAggregator};
use crate::config::{CredentialResolverRef, EnvCredentialResolver, ProviderOptions};
use crate::error::{ErrorCode, TributaryError};
use crate::event_stream::ProviderEventStream;
use crate::metrics::ExecutionMetrics;
use crate::request::{build_chat_request, build_streaming_request};
use crate::retry::{RetryController, DEFAULT_BASE_BACKOFF_MS};
use crate::transport::{http_transport_factory, ChatTransportRef, TransportFactory};
use crate::types::{ConversationMessage, ProviderEvent, ProviderResponse, ToolInfo};
use crate::vendor::{is_local_endpoint, Vendor};

/// OpenAI chat-completions client for one provider configuration and model.
///
/// Every call runs on its own copy of the credential and transport state, so a
/// credential refresh inside one run never leaks into another.
#[derive(Clone)]
pub struct ChatProvider {
    options: ProviderOptions,
    credentials: CredentialResolverRef,
    transport_factory: TransportFactory,
    base_backoff_ms: u64,
}

impl ChatProvider {
    pub fn new(options: ProviderOptions) -> Self {
        let credentials = EnvCredentialResolver::new(options.config.env.clone());
        Self {
            options,
            credentials: std::sync::Arc::new(credentials),
            transport_factory: http_transport_factory(),
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
        }
    }

    pub fn with_credentials(mut self, credentials: CredentialResolverRef) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_transport_factory(mut self, transport_factory: TransportFactory) -> Self {
        self.transport_factory = transport_factory;
        self
    }

    pub fn base_backoff_ms(mut self, base_backoff_ms: u64) -> Self {
        self.base_backoff_ms = base_backoff_ms;
        self
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    /// Streams one assistant turn. The returned stream ends with exactly one
    /// `Complete` or `Error`, except after a 429 from a local endpoint, which
    /// closes it without a terminal event.
    pub fn stream(
        &self,
        messages: &[ConversationMessage],
        tools: &[ToolInfo],
        abort: Option<AbortSignal>,
    ) -> ProviderEventStream {
        let request = build_streaming_request(&self.options, messages, tools);
        let mut run = RunState::new(self);
        let stream = ProviderEventStream::new();
        let writer = stream.clone();

        let task_writer = writer.clone();
        spawn_provider_task(writer, async move {
            if let Some(event) = run.stream_turn(request, abort.as_ref(), &task_writer).await {
                task_writer.push(event);
            }
            task_writer.end();
        });

        stream
    }

    /// Non-streaming variant with the same retry policy.
    pub async fn send(
        &self,
        messages: &[ConversationMessage],
        tools: &[ToolInfo],
        abort: Option<AbortSignal>,
    ) -> Result<ProviderResponse, TributaryError> {
        let request = build_chat_request(&self.options, messages, tools);
        let mut run = RunState::new(self);
        run.send_turn(request, abort.as_ref()).await
    }
}

enum NextStep {
    Retry,
    Stop(Option<TributaryError>),
}

/// State owned by a single run.
struct RunState {
    options: ProviderOptions,
    vendor: Vendor,
    credentials: CredentialResolverRef,
    transport_factory: TransportFactory,
    transport: Option<ChatTransportRef>,
    retry: RetryController,
    started: Instant,
}

impl RunState {
    fn new(provider: &ChatProvider) -> Self {
        let options = provider.options.clone();
        let retry = RetryController::new(
            options.config.max_retries(),
            is_local_endpoint(&options.config.base_url),
        )
        .base_backoff_ms(provider.base_backoff_ms);
        Self {
            vendor: options.vendor(),
            options,
            credentials: provider.credentials.clone(),
            transport_factory: provider.transport_factory.clone(),
            transport: None,
            retry,
            started: Instant::now(),
        }
    }

    fn provider_name(&self) -> &str {
        if self.options.config.id.is_empty() {
            "openai"
        } else {
            self.options.config.id.as_str()
        }
    }

    fn transport(&mut self) -> Result<ChatTransportRef, TributaryError> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        let api_key = self.credentials.resolve(&self.options.config.api_key)?;
        let transport = (self.transport_factory)(&self.options, &api_key)?;
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    fn refresh_credentials(&mut self) -> Result<(), TributaryError> {
        self.transport = None;
        self.transport().map(|_| ()).map_err(|error| {
            TributaryError::new(
                error.code,
                format!("failed to resolve API key after 401: {}", error.message),
            )
        })
    }

    async fn stream_turn(
        &mut self,
        request: Value,
        abort: Option<&AbortSignal>,
        writer: &ProviderEventStream,
    ) -> Option<ProviderEvent> {
        debug!(
            provider = self.provider_name(),
            model = self.options.model.id.as_str(),
            vendor = ?self.vendor,
            "starting streamed chat completion"
        );
        let mut gate = DeliveryGate::default();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            gate.begin_attempt();
            let outcome = match self.transport() {
                Ok(transport) => {
                    let vendor = self.vendor;
                    let debug_chunks = self.options.config.debug;
                    abortable(
                        abort,
                        stream_attempt(transport, &request, vendor, debug_chunks, &mut gate, writer),
                    )
                    .await
                }
                Err(error) => Err(error),
            };

            match outcome {
                Ok(response) => {
                    self.record_metrics(&response);
                    return Some(ProviderEvent::Complete { response });
                }
                Err(failure) => match self.recover(attempt, failure, abort).await {
                    NextStep::Retry => continue,
                    NextStep::Stop(error) => {
                        return error.map(|error| ProviderEvent::Error { error });
                    }
                },
            }
        }
    }

    async fn send_turn(
        &mut self,
        request: Value,
        abort: Option<&AbortSignal>,
    ) -> Result<ProviderResponse, TributaryError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match self.transport() {
                Ok(transport) => {
                    let vendor = self.vendor;
                    abortable(abort, async {
                        let body = transport.send(request.clone()).await?;
                        response_from_completion(vendor, &body)
                    })
                    .await
                }
                Err(error) => Err(error),
            };

            match outcome {
                Ok(response) => {
                    self.record_metrics(&response);
                    return Ok(response);
                }
                Err(failure) => {
                    let quiet = failure.clone();
                    match self.recover(attempt, failure, abort).await {
                        NextStep::Retry => continue,
                        NextStep::Stop(Some(error)) => return Err(error),
                        // There is no stream to close quietly; hand the 429 back.
                        NextStep::Stop(None) => return Err(quiet),
                    }
                }
            }
        }
    }

    async fn recover(
        &mut self,
        attempt: u32,
        failure: TributaryError,
        abort: Option<&AbortSignal>,
    ) -> NextStep {
        if failure.code == ErrorCode::EmptyResponse {
            return NextStep::Stop(Some(failure));
        }

        let decision = self.retry.decide(attempt, &failure);
        if !decision.should_retry {
            return NextStep::Stop(decision.terminal_error);
        }

        if decision.refresh_credentials {
            if let Err(error) = self.refresh_credentials() {
                return NextStep::Stop(Some(error));
            }
        }

        if decision.delay_ms > 0 {
            let delay = Duration::from_millis(decision.delay_ms);
            let waited = abortable(abort, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await;
            if let Err(error) = waited {
                return NextStep::Stop(Some(error));
            }
        } else if abort.is_some_and(AbortSignal::is_aborted) {
            return NextStep::Stop(Some(TributaryError::cancelled()));
        }

        NextStep::Retry
    }

    fn record_metrics(&self, response: &ProviderResponse) {
        if !self.options.config.debug {
            return;
        }
        ExecutionMetrics::from_run(
            self.started,
            Instant::now(),
            response.usage,
            self.options.model.id.as_str(),
            self.provider_name(),
            response.finish_reason,
        )
        .log();
    }
}

async fn stream_attempt(
    transport: ChatTransportRef,
    request: &Value,
    vendor: Vendor,
    debug_chunks: bool,
    gate: &mut DeliveryGate,
    writer: &ProviderEventStream,
) -> Result<ProviderResponse, TributaryError> {
    let mut chunks = transport.open_stream(request.clone()).await?;
    let mut aggregator = StreamAggregator::new(vendor);

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if debug_chunks {
            debug!(chunk = %chunk, "chat completions chunk");
        }
        for event in aggregator.apply_chunk(&chunk) {
            if let Some(event) = gate.admit(event) {
                writer.push(event);
            }
        }
    }

    aggregator.finish()
}

/// Keeps a restarted attempt from re-emitting what the caller already saw.
///
/// Text that replays the delivered prefix byte for byte is swallowed and only
/// the new tail is forwarded. Once an attempt produces text that departs from
/// what was delivered, that channel stays silent for the rest of the attempt
/// and the final `Complete` carries the authoritative turn. Tool-use starts
/// are forwarded once per call id.
#[derive(Debug, Default)]
struct DeliveryGate {
    delivered: HashMap<Channel, String>,
    attempt: HashMap<Channel, String>,
    diverged: HashSet<Channel>,
    started_calls: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Content,
    Thinking,
}

impl DeliveryGate {
    fn begin_attempt(&mut self) {
        self.attempt.clear();
        self.diverged.clear();
    }

    fn admit(&mut self, event: ProviderEvent) -> Option<ProviderEvent> {
        match event {
            ProviderEvent::ContentDelta { content } => self
                .unseen_suffix(Channel::Content, &content)
                .map(|content| ProviderEvent::ContentDelta { content }),
            ProviderEvent::ThinkingDelta { thinking } => self
                .unseen_suffix(Channel::Thinking, &thinking)
                .map(|thinking| ProviderEvent::ThinkingDelta { thinking }),
            ProviderEvent::ToolUseStart { tool_call } => self
                .started_calls
                .insert(tool_call.id.clone())
                .then_some(ProviderEvent::ToolUseStart { tool_call }),
            terminal => Some(terminal),
        }
    }

    fn unseen_suffix(&mut self, channel: Channel, text: &str) -> Option<String> {
        if self.diverged.contains(&channel) {
            return None;
        }
        let produced = self.attempt.entry(channel).or_default();
        produced.push_str(text);
        let delivered = self.delivered.entry(channel).or_default();

        if delivered.starts_with(produced.as_str()) {
            return None;
        }
        if let Some(suffix) = produced.strip_prefix(delivered.as_str()) {
            let suffix = suffix.to_string();
            delivered.push_str(&suffix);
            return Some(suffix);
        }

        debug!(channel = ?channel, "retried attempt diverged from delivered text");
        self.diverged.insert(channel);
        None
    }
}

async fn abortable<T, F>(abort: Option<&AbortSignal>, future: F) -> Result<T, TributaryError>
where
    F: Future<Output = Result<T, TributaryError>>,
{
    let Some(signal) = abort else {
        return future.await;
    };
    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(TributaryError::cancelled()),
        result = future => result,
    }
}

fn spawn_provider_task<F>(writer: ProviderEventStream, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(task);
        return;
    }

    std::thread::spawn(move || {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(task),
            Err(error) => fail_unstarted_run(&writer, error),
        }
    });
}

/// Closes a stream whose run never got a runtime to execute on.
fn fail_unstarted_run(writer: &ProviderEventStream, error: impl std::fmt::Display) {
    writer.push(ProviderEvent::Error {
        error: TributaryError::new(
            ErrorCode::Config,
            format!("failed to start async runtime for provider task: {error}"),
        ),
    });
    writer.end();
}
