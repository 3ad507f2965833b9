use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, ToolCallId};

/// Typed unit of the outbound stream.
///
/// Bracket contract, per id: `*Start` → `*Delta`* → `*End`, with at most one
/// open bracket per id and no deltas outside it. `Metadata` terminates a
/// generation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    ReasoningStart { id: BlockId },
    ReasoningDelta { id: BlockId, delta: String },
    ReasoningEnd { id: BlockId },

    TextStart { id: BlockId },
    TextDelta { id: BlockId, delta: String },
    TextEnd { id: BlockId },

    /// Tool activity. Payloads are opaque to the stream.
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: ToolCallId,
        tool_name: String,
        input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: ToolCallId,
        output: String,
        is_error: bool,
    },

    #[serde(rename_all = "camelCase")]
    Metadata { model_name: String },
}

/// Where an event sits in its id-scoped bracket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BracketRole {
    Open,
    Inside,
    Close,
}

impl StreamEvent {
    /// Bracket id and position, or `None` for unbracketed events.
    pub fn bracket(&self) -> Option<(&BlockId, BracketRole)> {
        match self {
            Self::ReasoningStart { id } | Self::TextStart { id } => Some((id, BracketRole::Open)),
            Self::ReasoningDelta { id, .. } | Self::TextDelta { id, .. } => {
                Some((id, BracketRole::Inside))
            }
            Self::ReasoningEnd { id } | Self::TextEnd { id } => Some((id, BracketRole::Close)),
            Self::ToolInputAvailable { .. }
            | Self::ToolOutputAvailable { .. }
            | Self::Metadata { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::Metadata { .. } => "metadata",
        }
    }
}
