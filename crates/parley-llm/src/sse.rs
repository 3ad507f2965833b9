use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use parley_core::errors::GatewayError;
use parley_core::ids::ToolCallId;
use parley_core::stream::{ModelEvent, StopReason, ToolCall};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

struct ToolBlock {
    id: String,
    name: String,
    arguments_json: String,
}

/// State machine turning Anthropic Messages API SSE events into [`ModelEvent`]s.
#[derive(Default)]
pub struct SseParser {
    current: Option<BlockKind>,
    tool_block: Option<ToolBlock>,
    signature: String,
    saw_tool_use: bool,
    stop_reason: Option<StopReason>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single SSE event and return zero or more model events.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<ModelEvent> {
        let mut events = Vec::new();

        match event_type {
            "message_start" => events.push(ModelEvent::Start),

            "content_block_start" => {
                let Ok(block) = serde_json::from_str::<ContentBlockStartEvent>(data) else {
                    return events;
                };
                match block.content_block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        self.current = Some(BlockKind::Text);
                        events.push(ModelEvent::TextStart);
                    }
                    Some("thinking") => {
                        self.current = Some(BlockKind::Thinking);
                        self.signature = block
                            .content_block
                            .get("signature")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        events.push(ModelEvent::ThinkingStart);
                    }
                    Some("tool_use") => {
                        let field = |k: &str| {
                            block
                                .content_block
                                .get(k)
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string()
                        };
                        let (id, name) = (field("id"), field("name"));
                        self.current = Some(BlockKind::ToolUse);
                        self.saw_tool_use = true;
                        events.push(ModelEvent::ToolCallStart {
                            tool_call_id: ToolCallId::from_raw(&id),
                            name: name.clone(),
                        });
                        self.tool_block = Some(ToolBlock {
                            id,
                            name,
                            arguments_json: String::new(),
                        });
                    }
                    _ => self.current = None,
                }
            }

            "content_block_delta" => {
                let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(data) else {
                    return events;
                };
                let text_of = |k: &str| {
                    delta
                        .delta
                        .get(k)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                match delta.delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => events.push(ModelEvent::TextDelta {
                        delta: text_of("text"),
                    }),
                    Some("thinking_delta") => events.push(ModelEvent::ThinkingDelta {
                        delta: text_of("thinking"),
                    }),
                    Some("input_json_delta") => {
                        if let Some(block) = self.tool_block.as_mut() {
                            let partial = text_of("partial_json");
                            block.arguments_json.push_str(&partial);
                            events.push(ModelEvent::ToolCallDelta {
                                tool_call_id: ToolCallId::from_raw(&block.id),
                                arguments_delta: partial,
                            });
                        }
                    }
                    Some("signature_delta") => self.signature.push_str(&text_of("signature")),
                    _ => {}
                }
            }

            "content_block_stop" => {
                match self.current.take() {
                    Some(BlockKind::Text) => events.push(ModelEvent::TextEnd),
                    Some(BlockKind::Thinking) => {
                        let signature = std::mem::take(&mut self.signature);
                        events.push(ModelEvent::ThinkingEnd {
                            signature: (!signature.is_empty()).then_some(signature),
                        });
                    }
                    Some(BlockKind::ToolUse) => {
                        if let Some(block) = self.tool_block.take() {
                            let arguments = if block.arguments_json.trim().is_empty() {
                                Value::Object(serde_json::Map::new())
                            } else {
                                serde_json::from_str(&block.arguments_json).unwrap_or_else(|e| {
                                    warn!(
                                        tool = %block.name,
                                        error = %e,
                                        "invalid tool arguments, using empty object"
                                    );
                                    Value::Object(serde_json::Map::new())
                                })
                            };
                            events.push(ModelEvent::ToolCallEnd {
                                tool_call: ToolCall {
                                    id: ToolCallId::from_raw(block.id),
                                    name: block.name,
                                    arguments,
                                },
                            });
                        }
                    }
                    None => {}
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    self.stop_reason = delta
                        .delta
                        .and_then(|d| d.stop_reason)
                        .as_deref()
                        .and_then(parse_stop_reason);
                }
            }

            "message_stop" => {
                let stop_reason = self.stop_reason.unwrap_or(if self.saw_tool_use {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                });
                events.push(ModelEvent::Done { stop_reason });
            }

            "error" => {
                if let Ok(err) = serde_json::from_str::<ErrorEvent>(data) {
                    events.push(ModelEvent::Error {
                        error: classify_error(&err),
                    });
                }
            }

            _ => {} // ping
        }

        events
    }
}

fn parse_stop_reason(raw: &str) -> Option<StopReason> {
    match raw {
        "end_turn" => Some(StopReason::EndTurn),
        "tool_use" => Some(StopReason::ToolUse),
        "max_tokens" => Some(StopReason::MaxTokens),
        "stop_sequence" => Some(StopReason::StopSequence),
        _ => None,
    }
}

fn classify_error(err: &ErrorEvent) -> GatewayError {
    match err.error.error_type.as_str() {
        "overloaded_error" => GatewayError::ProviderOverloaded,
        "rate_limit_error" => GatewayError::RateLimited { retry_after: None },
        "authentication_error" | "permission_error" => {
            GatewayError::AuthenticationFailed(err.error.message.clone())
        }
        "invalid_request_error" => GatewayError::InvalidRequest(err.error.message.clone()),
        _ => GatewayError::ServerError {
            status: 500,
            body: err.error.message.clone(),
        },
    }
}

/// Parse raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data.trim_start());
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((
                std::mem::take(&mut current_event),
                std::mem::take(&mut current_data),
            ));
        }
    }

    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    delta: Value,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
