use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_engine::DEFAULT_SINK_CAPACITY;
use parley_llm::ModelCatalog;

use crate::handlers;
use crate::orchestrator::RequestOrchestrator;

/// Server configuration.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sink_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub sink_capacity: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<RequestOrchestrator>, catalog: Arc<dyn ModelCatalog>) -> Self {
        Self {
            orchestrator,
            catalog,
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/models", get(handlers::models))
        .route("/api/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve in the background. Port 0 picks a free port.
pub async fn start(config: ServerConfig, mut state: AppState) -> Result<ServerHandle, std::io::Error> {
    state.sink_capacity = config.sink_capacity;
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Parley server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running;
/// call [`ServerHandle::shutdown`] to stop it.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and let in-flight responses finish.
    /// Connections still open after `grace` are dropped.
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        let mut server = self.server;
        if tokio::time::timeout(grace, &mut server).await.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "shutdown grace elapsed, aborting");
            server.abort();
            let _ = server.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::events::StreamEvent;
    use parley_engine::ToolRegistry;
    use parley_llm::{MockFactory, MockProvider, MockResponse, ModelEntry, StaticCatalog};
    use serde_json::json;

    fn catalog() -> Arc<dyn ModelCatalog> {
        Arc::new(StaticCatalog::new(vec![
            ModelEntry {
                id: "fast".into(),
                name: "Fast Model".into(),
                max_output: 4096,
                supports_reasoning: false,
                default: true,
            },
            ModelEntry {
                id: "smart".into(),
                name: "Smart Model".into(),
                max_output: 8192,
                supports_reasoning: true,
                default: false,
            },
        ]))
    }

    async fn serve(provider: Arc<MockProvider>) -> (ServerHandle, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::new(provider));
        let orchestrator = RequestOrchestrator::new(factory.clone(), Arc::new(ToolRegistry::new()));
        let state = AppState::new(Arc::new(orchestrator), catalog());
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        (start(config, state).await.unwrap(), factory)
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", handle.port, path)
    }

    fn parse_sse(body: &str) -> Vec<StreamEvent> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn health_reports_moderation_state() {
        let (handle, _) = serve(Arc::new(MockProvider::new(vec![]))).await;
        let body: serde_json::Value = reqwest::get(url(&handle, "/health")).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["moderation"], false);
    }

    #[tokio::test]
    async fn models_lists_catalog() {
        let (handle, _) = serve(Arc::new(MockProvider::new(vec![]))).await;
        let body: serde_json::Value = reqwest::get(url(&handle, "/api/models")).await.unwrap().json().await.unwrap();
        assert_eq!(
            body,
            json!([
                {"id": "fast", "name": "Fast Model", "default": true},
                {"id": "smart", "name": "Smart Model", "default": false},
            ])
        );
    }

    #[tokio::test]
    async fn chat_streams_events_as_sse() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("Hello!")]));
        let (handle, factory) = serve(provider.clone()).await;

        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .json(&json!({
                "messages": [{"id": "1", "role": "user", "parts": [{"type": "text", "text": "hello"}]}],
                "modelId": "smart"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/event-stream"));

        let events = parse_sse(&resp.text().await.unwrap());
        assert!(matches!(events[0], StreamEvent::TextStart { .. }));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Metadata { model_name: "Smart Model".into() })
        );
        assert_eq!(factory.created(), vec!["smart"]);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn chat_without_model_uses_default() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("Hi")]));
        let (handle, factory) = serve(provider).await;
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .json(&json!({"messages": [{"role": "user", "parts": [{"type": "text", "text": "hi"}]}]}))
            .send()
            .await
            .unwrap();
        let events = parse_sse(&resp.text().await.unwrap());
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Metadata { model_name: "Fast Model".into() })
        );
        assert_eq!(factory.created(), vec!["fast"]);
    }

    #[tokio::test]
    async fn unknown_model_rejected_before_streaming() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("never")]));
        let (handle, factory) = serve(provider.clone()).await;

        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .json(&json!({"messages": [], "modelId": "gpt-nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "unknown_model");
        assert!(factory.created().is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_body_rejected() {
        let (handle, _) = serve(Arc::new(MockProvider::new(vec![]))).await;
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn metrics_snapshot_counts_requests() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("Hi")]));
        let (handle, _) = serve(provider).await;
        reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .json(&json!({"messages": [{"role": "user", "parts": [{"type": "text", "text": "hi"}]}]}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let body: serde_json::Value = reqwest::get(url(&handle, "/api/metrics")).await.unwrap().json().await.unwrap();
        assert_eq!(body["counters"]["requests_total"], 1);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_request_finish() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(300),
            MockResponse::stream_text("late"),
        )]));
        let (handle, _) = serve(provider).await;
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .json(&json!({"messages": [{"role": "user", "parts": [{"type": "text", "text": "hi"}]}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let shutdown = tokio::spawn(handle.shutdown(Duration::from_secs(5)));
        let events = parse_sse(&resp.text().await.unwrap());
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { delta, .. } if delta == "late")));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Metadata { model_name: "Fast Model".into() })
        );
        shutdown.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_aborts_after_grace() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(30),
            MockResponse::stream_text("never"),
        )]));
        let (handle, _) = serve(provider).await;
        let resp = reqwest::Client::new()
            .post(url(&handle, "/api/chat"))
            .json(&json!({"messages": [{"role": "user", "parts": [{"type": "text", "text": "hi"}]}]}))
            .send()
            .await
            .unwrap();

        let started = std::time::Instant::now();
        handle.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(resp);
    }

    #[tokio::test]
    async fn shutdown_stops_server() {
        let (handle, _) = serve(Arc::new(MockProvider::new(vec![]))).await;
        let health = url(&handle, "/health");
        handle.shutdown(Duration::from_secs(1)).await;
        assert!(reqwest::get(health).await.is_err());
    }
}
