use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use parley_core::events::StreamEvent;
use parley_core::ids::{BlockId, IdNamespace};
use parley_core::messages::Message;
use parley_core::security::ApiKey;
use parley_telemetry::MetricsRecorder;

use crate::sink::{EventSender, SinkClosed};

pub const DEFAULT_MODERATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REGION: &str = "us";
const API_VERSION: &str = "2024-10-01";

/// Outcome of a moderation check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModerationDecision {
    pub violated: bool,
}

impl ModerationDecision {
    pub const ALLOWED: Self = Self { violated: false };
    pub const BLOCKED: Self = Self { violated: true };
}

/// Why a moderation call produced no verdict. Never leaves the gate.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("client setup failed: {0}")]
    Client(String),
}

impl ModerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::Client(_) => "client",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModerationConfig {
    pub api_key: ApiKey,
    pub endpoint: String,
    pub timeout: Duration,
}

impl ModerationConfig {
    pub fn new(api_key: ApiKey, region: &str) -> Self {
        Self {
            api_key,
            endpoint: default_endpoint(region),
            timeout: DEFAULT_MODERATION_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub fn default_endpoint(region: &str) -> String {
    format!("https://{region}.moderation.api.parley.dev/v1/moderate")
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<&'a str>,
    include_context: bool,
    include_policy_names: bool,
    double_check: bool,
    messages: [ModerationMessage<'a>; 1],
}

#[derive(Serialize)]
struct ModerationMessage<'a> {
    role: &'a str,
    content: String,
}

/// Checks the latest conversational message against the external classifier.
///
/// Fail-open: any failure to obtain a verdict counts as "not violated".
pub struct ModerationGate {
    client: Client,
    config: ModerationConfig,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ModerationGate {
    pub fn new(config: ModerationConfig) -> Result<Self, ModerationError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ModerationError::Client(e.to_string()))?;
        Ok(Self {
            client,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the check, bracketing the call with reasoning events on `sink`.
    /// Only a closed sink is reported as an error.
    #[instrument(skip_all, fields(messages = conversation.len()))]
    pub async fn check(
        &self,
        conversation: &[Message],
        sink: &EventSender,
    ) -> Result<ModerationDecision, SinkClosed> {
        let Some(candidate) = conversation.iter().rev().find(|m| m.role.is_conversational()) else {
            debug!("no user or assistant message, skipping moderation");
            self.record("skipped");
            return Ok(ModerationDecision::ALLOWED);
        };

        let external_id = conversation
            .iter()
            .filter_map(|m| m.id.as_deref())
            .find(|id| !id.is_empty());
        let request = ModerationRequest {
            external_id,
            include_context: true,
            include_policy_names: true,
            double_check: true,
            messages: [ModerationMessage {
                role: candidate.role.as_str(),
                content: candidate.text_content(),
            }],
        };

        let id = BlockId::new(IdNamespace::Moderation);
        sink.write(StreamEvent::ReasoningStart { id: id.clone() }).await?;

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.timeout, self.call(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ModerationError::Timeout(self.config.timeout)),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        sink.write(StreamEvent::ReasoningEnd { id }).await?;

        if let Some(metrics) = &self.metrics {
            metrics.observe("moderation_latency_ms", elapsed_ms);
        }

        let decision = match outcome {
            Ok(violated) => {
                debug!(violated, elapsed_ms, "moderation verdict");
                self.record(if violated { "blocked" } else { "allowed" });
                ModerationDecision { violated }
            }
            Err(error) => {
                warn!(error = %error, kind = error.kind(), elapsed_ms, "moderation unavailable, failing open");
                self.record("unavailable");
                ModerationDecision::ALLOWED
            }
        };
        Ok(decision)
    }

    async fn call(&self, request: &ModerationRequest<'_>) -> Result<bool, ModerationError> {
        let resp = self
            .client
            .post(&self.config.endpoint)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .header("x-api-version", API_VERSION)
            .bearer_auth(self.config.api_key.expose())
            .json(request)
            .send()
            .await
            .map_err(|e| ModerationError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ModerationError::Decode(e.to_string()))?;
        Ok(payload.get("violation").is_some_and(is_truthy))
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_labeled("moderation_checks_total", &[("outcome", outcome)], 1);
        }
    }
}

/// `true`, a non-zero number or a non-empty string.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null | Value::Array(_) | Value::Object(_) => false,
    }
}
