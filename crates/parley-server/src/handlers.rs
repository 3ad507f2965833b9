use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use parley_core::ids::RequestId;
use parley_core::messages::Message;
use parley_core::provider::ReasoningEffort;
use parley_engine::sink;
use parley_llm::models::resolve;

use crate::error::ApiError;
use crate::orchestrator::ChatRequest;
use crate::server::AppState;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub default: bool,
}

/// `POST /api/chat`: validate, then stream the orchestrator's events as SSE.
pub async fn chat(
    State(state): State<AppState>,
    body: Body,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (bytes, entries) = tokio::join!(
        axum::body::to_bytes(body, MAX_BODY_BYTES),
        state.catalog.models()
    );
    let bytes = bytes.map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    let body: ChatBody =
        serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let model = match (resolve(&entries, body.model_id.as_deref()), body.model_id) {
        (Some(entry), _) => entry.clone(),
        (None, Some(id)) => return Err(ApiError::UnknownModel(id)),
        (None, None) => return Err(ApiError::NoModels),
    };

    let request_id = RequestId::new();
    debug!(%request_id, model = %model.id, messages = body.messages.len(), "chat request accepted");

    let (tx, rx) = sink::channel(state.sink_capacity);
    let orchestrator = Arc::clone(&state.orchestrator);
    let request = ChatRequest {
        messages: body.messages,
        model,
        reasoning_effort: body.reasoning_effort,
    };
    tokio::spawn(async move {
        if let Err(error) = orchestrator.handle(request_id.clone(), request, tx).await {
            warn!(%request_id, error = %error, "request ended with error");
        }
    });

    let events = rx.into_stream().map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unserializable event")))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `GET /api/models`
pub async fn models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    let entries = state.catalog.models().await;
    Json(
        entries
            .into_iter()
            .map(|e| ModelInfo {
                id: e.id,
                name: e.name,
                default: e.default,
            })
            .collect(),
    )
}

/// `GET /api/metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.metrics().snapshot())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "moderation": state.orchestrator.moderation_enabled(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_body_accepts_wire_format() {
        let body: ChatBody = serde_json::from_str(
            r#"{
                "messages": [{"id": "1", "role": "user", "parts": [{"type": "text", "text": "hi"}]}],
                "modelId": "claude-haiku-4-5-20251001",
                "reasoningEffort": "low"
            }"#,
        )
        .unwrap();
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.model_id.as_deref(), Some("claude-haiku-4-5-20251001"));
        assert_eq!(body.reasoning_effort, Some(ReasoningEffort::Low));
    }

    #[test]
    fn optional_fields_default() {
        let body: ChatBody = serde_json::from_str(r#"{"messages": []}"#).unwrap();
        assert!(body.model_id.is_none());
        assert!(body.reasoning_effort.is_none());
    }

    #[test]
    fn unknown_effort_rejected() {
        assert!(serde_json::from_str::<ChatBody>(r#"{"messages": [], "reasoningEffort": "max"}"#).is_err());
    }
}
