use crate::errors::GatewayError;
use crate::ids::ToolCallId;

/// Events emitted by a model provider for one round trip. Ordering contract:
///
/// Start → (TextStart → TextDelta* → TextEnd | ThinkingStart → ThinkingDelta* → ThinkingEnd |
///          ToolCallStart → ToolCallDelta* → ToolCallEnd)* → Done
///
/// Error can appear at any point and ends the round trip.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    Start,

    TextStart,
    TextDelta { delta: String },
    TextEnd,

    ThinkingStart,
    ThinkingDelta { delta: String },
    /// `signature` is the provider's integrity token for the block; replaying
    /// the block on a later turn requires it.
    ThinkingEnd { signature: Option<String> },

    ToolCallStart { tool_call_id: ToolCallId, name: String },
    ToolCallDelta { tool_call_id: ToolCallId, arguments_delta: String },
    ToolCallEnd { tool_call: ToolCall },

    Done { stop_reason: StopReason },
    Error { error: GatewayError },
}

/// A fully assembled tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl ModelEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
