use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use parley_core::context::ModelContext;
use parley_core::errors::GatewayError;
use parley_core::ids::ToolCallId;
use parley_core::provider::{ModelEventStream, ModelProvider, StreamOptions};
use parley_core::stream::{ModelEvent, StopReason, ToolCall};

use crate::models::{ModelEntry, ProviderFactory};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of model events.
    Stream(Vec<ModelEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text answer.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            ModelEvent::Start,
            ModelEvent::TextStart,
            ModelEvent::TextDelta { delta: text.to_string() },
            ModelEvent::TextEnd,
            ModelEvent::Done { stop_reason: StopReason::EndTurn },
        ])
    }

    /// Thinking followed by a text answer.
    pub fn stream_thinking(thinking: &str, text: &str) -> Self {
        Self::Stream(vec![
            ModelEvent::Start,
            ModelEvent::ThinkingStart,
            ModelEvent::ThinkingDelta { delta: thinking.to_string() },
            ModelEvent::ThinkingEnd { signature: None },
            ModelEvent::TextStart,
            ModelEvent::TextDelta { delta: text.to_string() },
            ModelEvent::TextEnd,
            ModelEvent::Done { stop_reason: StopReason::EndTurn },
        ])
    }

    /// A single tool call with a fresh id.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::tool_calls(vec![(name, arguments)])
    }

    /// Several tool calls in one step, in the given order.
    pub fn tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        let mut events = vec![ModelEvent::Start];
        for (name, arguments) in calls {
            let id = ToolCallId::new();
            events.push(ModelEvent::ToolCallStart {
                tool_call_id: id.clone(),
                name: name.to_string(),
            });
            events.push(ModelEvent::ToolCallDelta {
                tool_call_id: id.clone(),
                arguments_delta: arguments.to_string(),
            });
            events.push(ModelEvent::ToolCallEnd {
                tool_call: ToolCall {
                    id,
                    name: name.to_string(),
                    arguments,
                },
            });
        }
        events.push(ModelEvent::Done { stop_reason: StopReason::ToolUse });
        Self::Stream(events)
    }

    /// A stream that ends with an error event.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![ModelEvent::Start, ModelEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    fallback: Option<MockResponse>,
    call_count: AtomicUsize,
    contexts: Mutex<Vec<ModelContext>>,
    options: Mutex<Vec<StreamOptions>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            fallback: None,
            call_count: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `response`.
    pub fn repeating(response: MockResponse) -> Self {
        Self::new(Vec::new()).with_fallback(response)
    }

    /// Response used once the programmed sequence is exhausted.
    pub fn with_fallback(mut self, response: MockResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Contexts received so far, one per call.
    pub fn contexts(&self) -> Vec<ModelContext> {
        self.contexts.lock().clone()
    }

    pub fn options(&self) -> Vec<StreamOptions> {
        self.options.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        context: &ModelContext,
        options: &StreamOptions,
    ) -> Result<ModelEventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().push(context.clone());
        self.options.lock().push(options.clone());

        let response = self
            .responses
            .get(idx)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "MockProvider: no response configured for call {idx}"
                ))
            })?;

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, unrolling nested delays iteratively.
async fn resolve_response(response: &MockResponse) -> Result<ModelEventStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events.clone()))),
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}

/// Factory handing out one shared [`MockProvider`] for every model.
pub struct MockFactory {
    provider: Arc<MockProvider>,
    created: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new(provider: Arc<MockProvider>) -> Self {
        Self {
            provider,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Model ids providers were created for, in order.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }
}

impl ProviderFactory for MockFactory {
    fn create(&self, entry: &ModelEntry) -> Result<Arc<dyn ModelProvider>, GatewayError> {
        self.created.lock().push(entry.id.clone());
        let provider: Arc<dyn ModelProvider> = self.provider.clone();
        Ok(provider)
    }
}
