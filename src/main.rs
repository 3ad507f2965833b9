//! Parley server binary: loads settings, wires the crates together and
//! serves the chat endpoint until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use parley_engine::{ModerationGate, ToolRegistry};
use parley_llm::{AnthropicFactory, StaticCatalog};
use parley_server::config::{load_settings, load_settings_from_path};
use parley_server::{AppState, RequestOrchestrator, ServerConfig};
use parley_telemetry::init_telemetry;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Moderated conversational AI endpoint")]
struct Cli {
    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Host to bind. Overrides settings.
    #[arg(long)]
    host: Option<String>,

    /// Settings file to load instead of `$PARLEY_HOME/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(host) = cli.host {
        settings.server.host = host;
    }

    let telemetry = init_telemetry(settings.telemetry_config());
    if let Err(e) = settings.log_level() {
        tracing::warn!(error = %e, "using info log level");
    }
    let metrics = telemetry.metrics();

    let api_key = settings
        .anthropic_api_key
        .clone()
        .context("ANTHROPIC_API_KEY is not set")?;
    let mut factory = AnthropicFactory::new(api_key).context("failed to build model client")?;
    if let Some(url) = &settings.model.base_url {
        factory = factory.with_base_url(url.clone());
    }

    let gate = match settings.moderation_config() {
        Some(config) => {
            tracing::info!(endpoint = %config.endpoint, "moderation enabled");
            let gate = ModerationGate::new(config).context("failed to build moderation client")?;
            Some(gate.with_metrics(Arc::clone(&metrics)))
        }
        None => {
            tracing::info!("no moderation credential, moderation disabled");
            None
        }
    };

    let orchestrator = RequestOrchestrator::new(Arc::new(factory), Arc::new(ToolRegistry::new()))
        .with_gate(gate)
        .with_loop_config(settings.loop_config())
        .with_metrics(metrics);
    let catalog = StaticCatalog::builtin(settings.model.default_model.as_deref());
    let state = AppState::new(Arc::new(orchestrator), Arc::new(catalog));

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        sink_capacity: settings.server.sink_capacity,
    };
    let handle = parley_server::start(config, state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "Parley server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
