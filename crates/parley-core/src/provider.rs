use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::ModelContext;
use crate::errors::GatewayError;
use crate::stream::ModelEvent;

pub type ModelEventStream = Pin<Box<dyn Stream<Item = ModelEvent> + Send>>;

/// Options controlling one generation round trip.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Client-selectable reasoning effort.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
}

impl ReasoningEffort {
    /// Thinking token budget requested from providers that support it.
    pub fn thinking_budget(self) -> u32 {
        match self {
            Self::Low => 2_048,
            Self::Medium => 8_192,
        }
    }
}

/// Trait implemented by each model provider.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(
        &self,
        context: &ModelContext,
        options: &StreamOptions,
    ) -> Result<ModelEventStream, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_options_defaults() {
        let opts = StreamOptions::default();
        assert!(opts.max_tokens.is_none());
        assert!(opts.temperature.is_none());
        assert!(opts.reasoning_effort.is_none());
    }

    #[test]
    fn reasoning_effort_wire_values() {
        let low: ReasoningEffort = serde_json::from_str(r#""low""#).unwrap();
        assert_eq!(low, ReasoningEffort::Low);
        let medium: ReasoningEffort = serde_json::from_str(r#""medium""#).unwrap();
        assert_eq!(medium, ReasoningEffort::Medium);
        assert!(serde_json::from_str::<ReasoningEffort>(r#""max""#).is_err());
    }

    #[test]
    fn medium_thinks_longer_than_low() {
        assert!(ReasoningEffort::Medium.thinking_budget() > ReasoningEffort::Low.thinking_budget());
    }
}
