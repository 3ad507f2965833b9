//! Request orchestrator: moderation gate, then refusal or generation, into
//! the request's event sink.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use parley_core::events::StreamEvent;
use parley_core::ids::{BlockId, IdNamespace, RequestId};
use parley_core::messages::Message;
use parley_core::provider::ReasoningEffort;
use parley_engine::{
    transform, EngineError, EventSender, GenerationLoop, LoopConfig, ModelConfig, ModerationGate,
    ToolRegistry,
};
use parley_llm::{ModelEntry, ProviderFactory};
use parley_telemetry::MetricsRecorder;

pub const REFUSAL_TEXT: &str = "I'm sorry, but I can't assist with that request. If you believe this is a mistake, please contact support.";

/// A validated generation request. The model is already resolved.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: ModelEntry,
    pub reasoning_effort: Option<ReasoningEffort>,
}

pub struct RequestOrchestrator {
    gate: Option<ModerationGate>,
    factory: Arc<dyn ProviderFactory>,
    tools: Arc<ToolRegistry>,
    loop_config: LoopConfig,
    metrics: Arc<MetricsRecorder>,
}

impl RequestOrchestrator {
    pub fn new(factory: Arc<dyn ProviderFactory>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            gate: None,
            factory,
            tools,
            loop_config: LoopConfig::default(),
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    /// Moderation runs only when a gate is supplied.
    pub fn with_gate(mut self, gate: Option<ModerationGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn moderation_enabled(&self) -> bool {
        self.gate.is_some()
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Produce the full event stream for one request into `sink`.
    ///
    /// A disconnected client ends production quietly and is not an error.
    #[instrument(skip_all, fields(request_id = %request_id, model = %request.model.id))]
    pub async fn handle(
        &self,
        request_id: RequestId,
        request: ChatRequest,
        sink: EventSender,
    ) -> Result<(), EngineError> {
        self.metrics.increment("requests_total", 1);
        let cancel = CancellationToken::new();
        match self.drive(request_id, request, &sink, &cancel).await {
            Err(e) if e.is_disconnect() => {
                debug!("client disconnected, stopping");
                cancel.cancel();
                Ok(())
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        request_id: RequestId,
        request: ChatRequest,
        sink: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let provider = self.factory.create(&request.model)?;

        if let Some(gate) = &self.gate {
            let decision = gate.check(&request.messages, sink).await?;
            if decision.violated {
                info!("request rejected by moderation");
                self.metrics.increment("requests_rejected_total", 1);
                return write_refusal(sink).await;
            }
        }

        let mut config = self.loop_config.clone();
        config.stream_options.reasoning_effort = request.reasoning_effort;

        let model = ModelConfig {
            provider,
            display_name: request.model.name.clone(),
        };
        let mut events = GenerationLoop::new(model, Arc::clone(&self.tools))
            .with_config(config)
            .with_request(request_id, cancel.clone())
            .with_metrics(Arc::clone(&self.metrics))
            .run(transform(&request.messages));

        while let Some(event) = events.next().await {
            sink.write(event).await?;
        }
        Ok(())
    }
}

async fn write_refusal(sink: &EventSender) -> Result<(), EngineError> {
    let id = BlockId::new(IdNamespace::Refusal);
    sink.write(StreamEvent::TextStart { id: id.clone() }).await?;
    sink.write(StreamEvent::TextDelta {
        id: id.clone(),
        delta: REFUSAL_TEXT.to_string(),
    })
    .await?;
    sink.write(StreamEvent::TextEnd { id }).await?;
    Ok(())
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("moderation", &self.gate.is_some())
            .field("tools", &self.tools.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_core::ids::IdNamespace;
    use parley_core::messages::{Part, Role};
    use parley_core::security::ApiKey;
    use parley_engine::moderation::ModerationConfig;
    use parley_engine::{sink, BracketChecker};
    use parley_llm::{MockFactory, MockProvider, MockResponse};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry() -> ModelEntry {
        ModelEntry {
            id: "mock-model".into(),
            name: "Mock Model".into(),
            max_output: 4096,
            supports_reasoning: true,
            default: true,
        }
    }

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            messages,
            model: entry(),
            reasoning_effort: None,
        }
    }

    fn hello() -> Vec<Message> {
        vec![Message::user_text("hello").with_id("1")]
    }

    fn orchestrator(provider: &Arc<MockProvider>) -> RequestOrchestrator {
        let factory = Arc::new(MockFactory::new(Arc::clone(provider)));
        RequestOrchestrator::new(factory, Arc::new(ToolRegistry::new()))
    }

    async fn moderation(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/moderate"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    fn gate(server: &MockServer, timeout: Duration) -> ModerationGate {
        let config = ModerationConfig::new(ApiKey::new("mod-key"), "us")
            .with_endpoint(format!("{}/v1/moderate", server.uri()))
            .with_timeout(timeout);
        ModerationGate::new(config).unwrap()
    }

    async fn run(orch: &RequestOrchestrator, req: ChatRequest) -> Vec<StreamEvent> {
        let (tx, rx) = sink::channel(16);
        let producer = orch.handle(RequestId::new(), req, tx);
        let (result, events) = tokio::join!(producer, rx.collect());
        result.unwrap();
        events
    }

    fn has_reasoning(events: &[StreamEvent]) -> bool {
        events
            .iter()
            .any(|e| matches!(e, StreamEvent::ReasoningStart { .. } | StreamEvent::ReasoningEnd { .. }))
    }

    #[tokio::test]
    async fn without_gate_streams_generation_only() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("Hi there")]));
        let orch = orchestrator(&provider);
        assert!(!orch.moderation_enabled());

        let events = run(&orch, request(hello())).await;

        assert!(!has_reasoning(&events));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Metadata { model_name: "Mock Model".into() })
        );
        assert_eq!(BracketChecker::validate(&events), Ok(()));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(orch.metrics().counter("requests_total"), 1);
    }

    #[tokio::test]
    async fn violation_produces_refusal_without_model_call() {
        let server = moderation(ResponseTemplate::new(200).set_body_json(json!({"violation": true}))).await;
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("never")]));
        let orch = orchestrator(&provider).with_gate(Some(gate(&server, Duration::from_secs(10))));

        let events = run(&orch, request(hello())).await;

        assert_eq!(events.len(), 5);
        let (StreamEvent::ReasoningStart { id: g1 }, StreamEvent::ReasoningEnd { id: g2 }) =
            (&events[0], &events[1])
        else {
            panic!("expected gate bracket, got {events:?}");
        };
        assert_eq!(g1, g2);
        assert_eq!(g1.namespace(), Some(IdNamespace::Moderation));

        match &events[2..] {
            [StreamEvent::TextStart { id: a }, StreamEvent::TextDelta { id: b, delta }, StreamEvent::TextEnd { id: c }] =>
            {
                assert!(a == b && b == c);
                assert_eq!(a.namespace(), Some(IdNamespace::Refusal));
                assert_eq!(delta, REFUSAL_TEXT);
            }
            other => panic!("expected refusal, got {other:?}"),
        }
        assert_eq!(provider.call_count(), 0);
        assert_eq!(orch.metrics().counter("requests_rejected_total"), 1);
    }

    #[tokio::test]
    async fn slow_moderation_fails_open() {
        let server = moderation(
            ResponseTemplate::new(200)
                .set_body_json(json!({"violation": true}))
                .set_delay(Duration::from_secs(5)),
        )
        .await;
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("Hi")]));
        let orch = orchestrator(&provider).with_gate(Some(gate(&server, Duration::from_millis(100))));

        let events = run(&orch, request(hello())).await;

        assert!(matches!(events[0], StreamEvent::ReasoningStart { .. }));
        assert!(matches!(events[1], StreamEvent::ReasoningEnd { .. }));
        assert!(matches!(&events[2], StreamEvent::TextStart { id } if id.namespace() == Some(IdNamespace::Generation)));
        assert!(matches!(events.last(), Some(StreamEvent::Metadata { .. })));
        assert_eq!(BracketChecker::validate(&events), Ok(()));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn allowed_request_has_gate_bracket_then_generation() {
        let server = moderation(ResponseTemplate::new(200).set_body_json(json!({"violation": false}))).await;
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("Hi")]));
        let orch = orchestrator(&provider).with_gate(Some(gate(&server, Duration::from_secs(10))));

        let events = run(&orch, request(hello())).await;
        assert!(matches!(events[0], StreamEvent::ReasoningStart { .. }));
        assert!(matches!(events[1], StreamEvent::ReasoningEnd { .. }));
        assert_eq!(events.len(), 2 + 4);
        assert_eq!(BracketChecker::validate(&events), Ok(()));
    }

    #[tokio::test]
    async fn diagnostic_reports_rewritten_before_generation() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("fixed")]));
        let orch = orchestrator(&provider);
        let messages = vec![Message::new(
            Role::User,
            vec![Part::DiagnosticReport {
                summary: "X failed".into(),
                paths: vec!["a.ts".into(), "b.ts".into()],
            }],
        )];

        run(&orch, request(messages)).await;

        let contexts = provider.contexts();
        let sent = &contexts[0].messages[0];
        assert_eq!(sent.parts.len(), 1);
        let Part::Text { text } = &sent.parts[0] else {
            panic!("expected text part, got {:?}", sent.parts[0]);
        };
        assert!(text.contains("X failed"));
        assert!(text.contains("a.ts\nb.ts"));
    }

    #[tokio::test]
    async fn budget_exhaustion_still_delivers_text() {
        let provider = Arc::new(MockProvider::repeating(MockResponse::Stream(vec![
            parley_core::stream::ModelEvent::Start,
            parley_core::stream::ModelEvent::TextStart,
            parley_core::stream::ModelEvent::TextDelta { delta: "working".into() },
            parley_core::stream::ModelEvent::TextEnd,
            parley_core::stream::ModelEvent::ToolCallEnd {
                tool_call: parley_core::stream::ToolCall {
                    id: parley_core::ids::ToolCallId::new(),
                    name: "missing_tool".into(),
                    arguments: json!({}),
                },
            },
            parley_core::stream::ModelEvent::Done {
                stop_reason: parley_core::stream::StopReason::ToolUse,
            },
        ])));
        let orch = orchestrator(&provider);

        let events = run(&orch, request(hello())).await;

        assert_eq!(provider.call_count(), 20);
        let texts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TextDelta { .. }))
            .count();
        assert_eq!(texts, 20);
        assert!(matches!(events.last(), Some(StreamEvent::Metadata { .. })));
        assert_eq!(orch.metrics().counter("generation_failures_total"), 0);
    }

    #[tokio::test]
    async fn reasoning_effort_forwarded_to_provider() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("ok")]));
        let orch = orchestrator(&provider);
        let mut req = request(hello());
        req.reasoning_effort = Some(ReasoningEffort::Medium);

        run(&orch, req).await;
        assert_eq!(provider.options()[0].reasoning_effort, Some(ReasoningEffort::Medium));
    }

    #[tokio::test]
    async fn disconnected_client_stops_quietly() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("lost")]));
        let orch = orchestrator(&provider);
        let (tx, rx) = sink::channel(1);
        drop(rx);

        let result = orch.handle(RequestId::new(), request(hello()), tx).await;
        assert!(result.is_ok());
    }
}
