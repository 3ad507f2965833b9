use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use parley_core::errors::GatewayError;
use parley_core::provider::ModelProvider;
use parley_core::security::ApiKey;

use crate::provider::AnthropicProvider;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Static capabilities of a built-in Claude model.
#[derive(Clone, Debug)]
pub struct ClaudeModelInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub max_output: u32,
    pub supports_reasoning: bool,
}

pub static CLAUDE_OPUS_4_6: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-opus-4-6",
    display_name: "Claude Opus 4.6",
    max_output: 32_000,
    supports_reasoning: true,
};

pub static CLAUDE_SONNET_4_5: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-sonnet-4-5-20250929",
    display_name: "Claude Sonnet 4.5",
    max_output: 16_384,
    supports_reasoning: true,
};

pub static CLAUDE_HAIKU_4_5: ClaudeModelInfo = ClaudeModelInfo {
    name: "claude-haiku-4-5-20251001",
    display_name: "Claude Haiku 4.5",
    max_output: 8_192,
    supports_reasoning: false,
};

static ALL_MODELS: &[&ClaudeModelInfo] = &[&CLAUDE_OPUS_4_6, &CLAUDE_SONNET_4_5, &CLAUDE_HAIKU_4_5];

pub fn find_model(name: &str) -> Option<&'static ClaudeModelInfo> {
    ALL_MODELS.iter().find(|m| m.name == name).copied()
}

pub fn default_model() -> &'static ClaudeModelInfo {
    &CLAUDE_SONNET_4_5
}

/// A selectable model as offered to clients.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    pub max_output: u32,
    pub supports_reasoning: bool,
    pub default: bool,
}

impl ModelEntry {
    fn from_info(info: &ClaudeModelInfo, default: bool) -> Self {
        Self {
            id: info.name.to_string(),
            name: info.display_name.to_string(),
            max_output: info.max_output,
            supports_reasoning: info.supports_reasoning,
            default,
        }
    }
}

/// Source of the models a request may select from.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn models(&self) -> Vec<ModelEntry>;
}

/// Pick the requested model, or the default entry when none was requested.
/// Returns `None` for an unknown id.
pub fn resolve<'a>(entries: &'a [ModelEntry], requested: Option<&str>) -> Option<&'a ModelEntry> {
    match requested {
        Some(id) => entries.iter().find(|e| e.id == id),
        None => entries.iter().find(|e| e.default).or_else(|| entries.first()),
    }
}

/// Fixed in-process catalog.
pub struct StaticCatalog {
    entries: Vec<ModelEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self { entries }
    }

    /// The built-in Claude models. `default_id` selects the default entry;
    /// an unknown id falls back to the built-in default.
    pub fn builtin(default_id: Option<&str>) -> Self {
        let default_name = default_id
            .and_then(find_model)
            .unwrap_or_else(default_model)
            .name;
        let entries = ALL_MODELS
            .iter()
            .map(|m| ModelEntry::from_info(m, m.name == default_name))
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl ModelCatalog for StaticCatalog {
    async fn models(&self) -> Vec<ModelEntry> {
        self.entries.clone()
    }
}

/// Builds a provider for a resolved catalog entry.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, entry: &ModelEntry) -> Result<Arc<dyn ModelProvider>, GatewayError>;
}

/// Creates [`AnthropicProvider`]s sharing one HTTP client.
pub struct AnthropicFactory {
    client: Client,
    api_key: ApiKey,
    base_url: Option<String>,
}

impl AnthropicFactory {
    pub fn new(api_key: ApiKey) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

impl ProviderFactory for AnthropicFactory {
    fn create(&self, entry: &ModelEntry) -> Result<Arc<dyn ModelProvider>, GatewayError> {
        let mut provider =
            AnthropicProvider::new(self.client.clone(), self.api_key.clone(), entry.clone());
        if let Some(url) = &self.base_url {
            provider = provider.with_base_url(url.clone());
        }
        let provider: Arc<dyn ModelProvider> = Arc::new(provider);
        Ok(provider)
    }
}
