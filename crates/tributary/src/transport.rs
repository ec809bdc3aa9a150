use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use futures_util::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderOptions;
use crate::error::{ErrorCode, TributaryError};
use crate::sse::SseDecoder;
use crate::vendor::is_loopback_base_url;

/// Parsed chat-completion chunks of one streamed response, ending at `[DONE]`
/// or end of body.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, TributaryError>> + Send>>;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TributaryError>> + Send + 'a>>;

pub trait ChatTransport: Send + Sync {
    fn open_stream(&self, request: Value) -> TransportFuture<'_, ChunkStream>;
    fn send(&self, request: Value) -> TransportFuture<'_, Value>;
}

pub type ChatTransportRef = Arc<dyn ChatTransport>;

/// Builds a transport for the given options and resolved API key. Called when
/// a run starts and again after a credential refresh.
pub type TransportFactory = Arc<
    dyn Fn(&ProviderOptions, &str) -> Result<ChatTransportRef, TributaryError> + Send + Sync,
>;

pub fn http_transport_factory() -> TransportFactory {
    Arc::new(
        |options: &ProviderOptions, api_key: &str| -> Result<ChatTransportRef, TributaryError> {
            Ok(Arc::new(HttpTransport::new(options, api_key)))
        },
    )
}

pub struct HttpTransport {
    client: &'static Client,
    endpoint: String,
    api_key: String,
    headers: HashMap<String, String>,
    debug: bool,
}

impl HttpTransport {
    pub fn new(options: &ProviderOptions, api_key: &str) -> Self {
        Self {
            client: shared_http_client(&options.config.base_url),
            endpoint: join_url(&options.config.base_url, "chat/completions"),
            api_key: api_key.to_string(),
            headers: options.config.extra_headers.clone(),
            debug: options.config.debug,
        }
    }

    async fn post(&self, request: &Value) -> Result<reqwest::Response, TributaryError> {
        if self.debug {
            debug!(endpoint = self.endpoint.as_str(), payload = %request, "chat completions request");
        }

        let mut builder = self
            .client
            .post(self.endpoint.as_str())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let response = builder.json(request).send().await.map_err(|error| {
            TributaryError::new(
                ErrorCode::Transport,
                format!("chat completions transport failed: {error}"),
            )
        })?;
        error_for_status(response).await
    }
}

impl ChatTransport for HttpTransport {
    fn open_stream(&self, request: Value) -> TransportFuture<'_, ChunkStream> {
        Box::pin(async move {
            let response = self.post(&request).await?;
            Ok(decode_sse_chunks(response.bytes_stream()))
        })
    }

    fn send(&self, request: Value) -> TransportFuture<'_, Value> {
        Box::pin(async move {
            let response = self.post(&request).await?;
            let body = response.text().await.map_err(|error| {
                TributaryError::new(
                    ErrorCode::Transport,
                    format!("chat completions read failed: {error}"),
                )
            })?;
            if self.debug {
                debug!(body = body.as_str(), "chat completions response");
            }
            serde_json::from_str(&body).map_err(|error| {
                TributaryError::new(
                    ErrorCode::Protocol,
                    format!("invalid chat completions response JSON: {error}"),
                )
            })
        })
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, TributaryError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read error body".to_string());
    Err(TributaryError::http(status, body, retry_after))
}

struct SseChunkState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    queued: VecDeque<String>,
    exhausted: bool,
}

/// Turns a raw SSE byte stream into parsed chunk values. A read error or an
/// unparsable chunk is yielded once and ends the stream.
pub fn decode_sse_chunks<S, B, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseChunkState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        queued: VecDeque::new(),
        exhausted: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.queued.pop_front() {
                if data == "[DONE]" {
                    return None;
                }
                let parsed = serde_json::from_str::<Value>(&data).map_err(|error| {
                    TributaryError::new(
                        ErrorCode::Protocol,
                        format!("invalid chat completions chunk JSON: {error}"),
                    )
                    .with_details(json!({ "chunk": data }))
                });
                if parsed.is_err() {
                    state.queued.clear();
                    state.exhausted = true;
                }
                return Some((parsed, state));
            }
            if state.exhausted {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.feed(bytes.as_ref());
                    state.queued.extend(events);
                }
                Some(Err(error)) => {
                    state.exhausted = true;
                    let error = TributaryError::new(
                        ErrorCode::Transport,
                        format!("chat completions stream read failed: {error}"),
                    );
                    return Some((Err(error), state));
                }
                None => {
                    state.exhausted = true;
                    let trailing = state.decoder.finish();
                    state.queued.extend(trailing);
                }
            }
        }
    }))
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

fn shared_http_client(base_url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_base_url(base_url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(chunks: Vec<Result<&'static str, &'static str>>) -> ChunkStream {
        decode_sse_chunks(stream::iter(chunks.into_iter().map(|chunk| chunk.map(str::as_bytes))))
    }

    #[tokio::test]
    async fn stops_at_done_marker() {
        let mut chunks = byte_stream(vec![
            Ok("data: {\"id\":1}\n\ndata: [DONE]\n\n"),
            Ok("data: {\"id\":2}\n\n"),
        ]);
        assert_eq!(chunks.next().await.unwrap().unwrap(), json!({ "id": 1 }));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn end_of_body_without_done_flushes_trailing_chunk() {
        let mut chunks = byte_stream(vec![Ok("data: {\"id\":1}\n\ndata: {\"id\":2}")]);
        assert_eq!(chunks.next().await.unwrap().unwrap(), json!({ "id": 1 }));
        assert_eq!(chunks.next().await.unwrap().unwrap(), json!({ "id": 2 }));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn read_error_is_reported_once_as_transport_error() {
        let mut chunks = byte_stream(vec![Ok("data: {\"id\":1}\n\n"), Err("connection reset")]);
        assert!(chunks.next().await.unwrap().is_ok());
        let error = chunks.next().await.unwrap().unwrap_err();
        assert_eq!(error.code, ErrorCode::Transport);
        assert!(error.message.contains("connection reset"));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_chunk_json_is_a_protocol_error() {
        let mut chunks = byte_stream(vec![Ok("data: {not json\n\ndata: {\"id\":2}\n\n")]);
        let error = chunks.next().await.unwrap().unwrap_err();
        assert_eq!(error.code, ErrorCode::Protocol);
        assert!(chunks.next().await.is_none());
    }

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.openai.com/v1", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn http_client_is_reused_across_transports() {
        let first = shared_http_client("https://api.openai.com/v1");
        let second = shared_http_client("https://api.openai.com/v1");
        assert!(std::ptr::eq(first, second));
    }
}
