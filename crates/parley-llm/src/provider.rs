use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use tracing::{debug, instrument};

use parley_core::context::ModelContext;
use parley_core::errors::GatewayError;
use parley_core::provider::{ModelEventStream, ModelProvider, StreamOptions};
use parley_core::security::ApiKey;
use parley_core::stream::ModelEvent;

use crate::converter;
use crate::models::ModelEntry;
use crate::sse::{self, SseParser};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streaming client for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: ApiKey,
    model: ModelEntry,
    url: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, api_key: ApiKey, model: ModelEntry) -> Self {
        Self {
            client,
            api_key,
            model,
            url: API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn build_request(&self, context: &ModelContext, options: &StreamOptions) -> reqwest::RequestBuilder {
        let body = converter::build_request_body(context, options, &self.model);
        self.client
            .post(&self.url)
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", API_VERSION)
            .header("accept", "text/event-stream")
            .header("content-type", "application/json")
            .json(&body)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model.id
    }

    #[instrument(skip(self, context, options), fields(model = %self.model.id))]
    async fn stream(
        &self,
        context: &ModelContext,
        options: &StreamOptions,
    ) -> Result<ModelEventStream, GatewayError> {
        let resp = self
            .build_request(context, options)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }

        debug!(status = resp.status().as_u16(), "model stream opened");
        Ok(Box::pin(SseStream::new(resp.bytes_stream())))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Wraps a response byte stream and yields [`ModelEvent`]s.
/// Emits an error if no data arrives within the idle window.
struct SseStream {
    inner: ByteStream,
    parser: SseParser,
    buffer: Vec<u8>,
    pending: VecDeque<ModelEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn feed(&mut self, chunk: &str) {
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            self.pending.extend(self.parser.parse_event(&event_type, &data));
        }
    }

    /// Appends raw bytes with carriage returns removed. Decoding waits for
    /// a complete event so multi-byte characters split across chunks survive.
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
    }

    fn drain_complete_events(&mut self) {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let rest = self.buffer.split_off(pos + 2);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            self.feed(&String::from_utf8_lossy(&chunk));
        }
    }

    fn fail(&mut self, error: GatewayError) -> Poll<Option<ModelEvent>> {
        self.finished = true;
        Poll::Ready(Some(ModelEvent::Error { error }))
    }
}

impl Stream for SseStream {
    type Item = ModelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.finished = true;
                    self.pending.clear();
                }
                return Poll::Ready(Some(event));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    self.push_bytes(&bytes);
                    self.drain_complete_events();
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.fail(GatewayError::StreamInterrupted(e.to_string()));
                }
                Poll::Ready(None) => {
                    let remaining = std::mem::take(&mut self.buffer);
                    if !remaining.is_empty() {
                        self.feed(&String::from_utf8_lossy(&remaining));
                    }
                    if self.pending.is_empty() {
                        return self.fail(GatewayError::StreamInterrupted(
                            "stream ended before message_stop".into(),
                        ));
                    }
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        return self.fail(GatewayError::StreamInterrupted(format!(
                            "idle timeout after {secs}s"
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
