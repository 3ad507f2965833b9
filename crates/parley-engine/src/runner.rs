use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{FutureExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use parley_core::context::ModelContext;
use parley_core::errors::GatewayError;
use parley_core::events::StreamEvent;
use parley_core::ids::{BlockId, IdNamespace, RequestId, ToolCallId};
use parley_core::messages::{Message, Part, Role};
use parley_core::provider::{ModelProvider, StreamOptions};
use parley_core::stream::{ModelEvent, ToolCall};
use parley_core::tools::{ExecutionMode, ToolContext};
use parley_telemetry::MetricsRecorder;

use crate::registry::ToolRegistry;
use crate::truncate;

pub const DEFAULT_STEP_BUDGET: u32 = 20;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Configuration for a generation run.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub step_budget: u32,
    pub tool_timeout: Duration,
    pub stream_options: StreamOptions,
    pub system_prompt: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            stream_options: StreamOptions::default(),
            system_prompt: None,
        }
    }
}

/// The model a run talks to and the name reported in `Metadata`.
#[derive(Clone)]
pub struct ModelConfig {
    pub provider: Arc<dyn ModelProvider>,
    pub display_name: String,
}

struct StepState {
    history: Vec<Message>,
    steps_taken: u32,
    done: bool,
}

impl StepState {
    fn new(history: Vec<Message>, budget: u32) -> Self {
        Self {
            history,
            steps_taken: 0,
            done: budget == 0,
        }
    }

    fn record(&mut self, mut parts: Vec<Part>, outcomes: Vec<ToolOutcome>) {
        parts.extend(outcomes.into_iter().map(|o| Part::ToolResult {
            tool_call_id: o.id,
            tool_name: o.name,
            output: o.content,
            is_error: o.is_error,
        }));
        if !parts.is_empty() {
            self.history.push(Message::new(Role::Assistant, parts));
        }
    }
}

/// Raw output of one round trip, held in memory before re-emission.
struct Drained {
    events: Vec<ModelEvent>,
    failure: Option<GatewayError>,
}

struct ToolOutcome {
    id: ToolCallId,
    name: String,
    content: String,
    is_error: bool,
}

/// Multi-step, tool-capable generation bounded by a step budget.
///
/// Each step drains the provider stream completely, then re-emits it as
/// [`StreamEvent`]s with `gen_` block ids. Tool calls are executed and their
/// results fed back for the next step. Provider failures end the run early
/// and are never surfaced as errors; the stream always ends with one
/// `Metadata` event.
pub struct GenerationLoop {
    model: ModelConfig,
    tools: Arc<ToolRegistry>,
    config: LoopConfig,
    request_id: RequestId,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl GenerationLoop {
    pub fn new(model: ModelConfig, tools: Arc<ToolRegistry>) -> Self {
        Self {
            model,
            tools,
            config: LoopConfig::default(),
            request_id: RequestId::new(),
            cancel: CancellationToken::new(),
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_request(mut self, request_id: RequestId, cancel: CancellationToken) -> Self {
        self.request_id = request_id;
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn run(self, history: Vec<Message>) -> EventStream {
        let this = self;
        Box::pin(stream! {
            let mut state = StepState::new(history, this.config.step_budget);

            while !state.done {
                let drained = this.drain_step(&state).await;
                state.steps_taken += 1;

                let step = translate(drained.events);
                for event in step.events {
                    yield event;
                }

                if let Some(error) = drained.failure {
                    warn!(
                        request_id = %this.request_id,
                        step = state.steps_taken,
                        error = %error,
                        kind = error.error_kind(),
                        "model communication failed, ending generation early"
                    );
                    if let Some(metrics) = &this.metrics {
                        metrics.increment("generation_failures_total", 1);
                    }
                    state.done = true;
                } else if step.tool_calls.is_empty() {
                    state.record(step.parts, Vec::new());
                    state.done = true;
                } else {
                    for call in &step.tool_calls {
                        yield StreamEvent::ToolInputAvailable {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            input: call.arguments.clone(),
                        };
                    }

                    let outcomes = this.execute_tools(&step.tool_calls).await;
                    for outcome in &outcomes {
                        yield StreamEvent::ToolOutputAvailable {
                            tool_call_id: outcome.id.clone(),
                            output: outcome.content.clone(),
                            is_error: outcome.is_error,
                        };
                    }
                    state.record(step.parts, outcomes);

                    if state.steps_taken >= this.config.step_budget {
                        info!(
                            request_id = %this.request_id,
                            budget = this.config.step_budget,
                            "step budget reached"
                        );
                        state.done = true;
                    }
                }
            }

            debug!(request_id = %this.request_id, steps = state.steps_taken, "generation finished");
            if let Some(metrics) = &this.metrics {
                metrics.observe("generation_steps", f64::from(state.steps_taken));
            }
            yield StreamEvent::Metadata { model_name: this.model.display_name.clone() };
        })
    }

    #[instrument(skip_all, fields(request_id = %self.request_id, step = state.steps_taken + 1))]
    async fn drain_step(&self, state: &StepState) -> Drained {
        let context = ModelContext::new(state.history.clone(), self.tools.definitions())
            .with_system_prompt(self.config.system_prompt.clone());

        let mut stream = match self
            .model
            .provider
            .stream(&context, &self.config.stream_options)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                return Drained {
                    events: Vec::new(),
                    failure: Some(error),
                }
            }
        };

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                ModelEvent::Error { error } => {
                    return Drained {
                        events,
                        failure: Some(error),
                    }
                }
                ModelEvent::Done { stop_reason } => {
                    debug!(?stop_reason, events = events.len(), "step drained");
                    break;
                }
                other => events.push(other),
            }
        }
        Drained {
            events,
            failure: None,
        }
    }

    /// Run a step's tool calls. Concurrent tools run together, sequential
    /// ones one at a time; outcomes come back in call order.
    async fn execute_tools(&self, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        let (sequential, concurrent): (Vec<usize>, Vec<usize>) = (0..calls.len())
            .partition(|&i| self.tools.mode(&calls[i].name) == Some(ExecutionMode::Sequential));

        let mut outcomes: Vec<Option<ToolOutcome>> = calls.iter().map(|_| None).collect();

        let batch = concurrent
            .iter()
            .map(|&i| self.execute_one(&calls[i]).map(move |outcome| (i, outcome)));
        for (i, outcome) in futures::future::join_all(batch).await {
            outcomes[i] = Some(outcome);
        }

        for i in sequential {
            outcomes[i] = Some(self.execute_one(&calls[i]).await);
        }

        outcomes.into_iter().flatten().collect()
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolOutcome {
        let outcome = |content: String, is_error: bool| ToolOutcome {
            id: call.id.clone(),
            name: call.name.clone(),
            content: truncate::truncate_output(&content, truncate::MAX_TOOL_OUTPUT),
            is_error,
        };

        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "model called an unknown tool");
            return outcome(format!("Unknown tool: {}", call.name), true);
        };

        let ctx = ToolContext {
            request_id: self.request_id.clone(),
            abort_signal: self.cancel.clone(),
        };
        let timeout = self.config.tool_timeout;
        let result = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(r))) => outcome(r.content, r.is_error),
            Ok(Ok(Err(e))) => outcome(e.to_string(), true),
            Ok(Err(panic)) => {
                error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
                outcome("Internal error: tool crashed".into(), true)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                outcome(format!("Tool timed out after {}ms", timeout.as_millis()), true)
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

/// One step re-expressed as stream events plus what it contributes to history.
struct TranslatedStep {
    events: Vec<StreamEvent>,
    parts: Vec<Part>,
    tool_calls: Vec<ToolCall>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Reasoning,
    Text,
}

struct OpenBlock {
    kind: BlockKind,
    id: BlockId,
    buffer: String,
    signature: Option<String>,
}

#[derive(Default)]
struct Translator {
    events: Vec<StreamEvent>,
    parts: Vec<Part>,
    tool_calls: Vec<ToolCall>,
    open: Option<OpenBlock>,
}

impl Translator {
    fn open(&mut self, kind: BlockKind) {
        self.close();
        let id = BlockId::new(IdNamespace::Generation);
        self.events.push(match kind {
            BlockKind::Reasoning => StreamEvent::ReasoningStart { id: id.clone() },
            BlockKind::Text => StreamEvent::TextStart { id: id.clone() },
        });
        self.open = Some(OpenBlock {
            kind,
            id,
            buffer: String::new(),
            signature: None,
        });
    }

    fn delta(&mut self, kind: BlockKind, delta: String) {
        if delta.is_empty() {
            return;
        }
        if self.open.as_ref().map(|b| b.kind) != Some(kind) {
            self.open(kind);
        }
        let Some(block) = self.open.as_mut() else {
            return;
        };
        block.buffer.push_str(&delta);
        let id = block.id.clone();
        self.events.push(match kind {
            BlockKind::Reasoning => StreamEvent::ReasoningDelta { id, delta },
            BlockKind::Text => StreamEvent::TextDelta { id, delta },
        });
    }

    fn end(&mut self, kind: BlockKind, signature: Option<String>) {
        if let Some(block) = self.open.as_mut().filter(|b| b.kind == kind) {
            block.signature = signature;
            self.close();
        }
    }

    fn close(&mut self) {
        let Some(block) = self.open.take() else {
            return;
        };
        match block.kind {
            BlockKind::Reasoning => {
                self.events.push(StreamEvent::ReasoningEnd { id: block.id });
                if !block.buffer.is_empty() {
                    self.parts.push(Part::Reasoning {
                        text: block.buffer,
                        signature: block.signature,
                    });
                }
            }
            BlockKind::Text => {
                self.events.push(StreamEvent::TextEnd { id: block.id });
                if !block.buffer.is_empty() {
                    self.parts.push(Part::Text { text: block.buffer });
                }
            }
        }
    }

    fn tool_call(&mut self, call: ToolCall) {
        self.close();
        self.parts.push(Part::ToolCall {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            input: call.arguments.clone(),
        });
        self.tool_calls.push(call);
    }
}

/// Translate drained model events. Any bracket still open at the end (a
/// failure mid-block) is closed so the output stays well formed.
fn translate(events: Vec<ModelEvent>) -> TranslatedStep {
    let mut t = Translator::default();
    for event in events {
        match event {
            ModelEvent::TextStart => t.open(BlockKind::Text),
            ModelEvent::TextDelta { delta } => t.delta(BlockKind::Text, delta),
            ModelEvent::TextEnd => t.end(BlockKind::Text, None),
            ModelEvent::ThinkingStart => t.open(BlockKind::Reasoning),
            ModelEvent::ThinkingDelta { delta } => t.delta(BlockKind::Reasoning, delta),
            ModelEvent::ThinkingEnd { signature } => t.end(BlockKind::Reasoning, signature),
            ModelEvent::ToolCallEnd { tool_call } => t.tool_call(tool_call),
            ModelEvent::Start
            | ModelEvent::ToolCallStart { .. }
            | ModelEvent::ToolCallDelta { .. }
            | ModelEvent::Done { .. }
            | ModelEvent::Error { .. } => {}
        }
    }
    t.close();
    TranslatedStep {
        events: t.events,
        parts: t.parts,
        tool_calls: t.tool_calls,
    }
}
