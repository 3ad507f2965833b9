//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `$PARLEY_HOME/settings.json` exists, deep-merge file values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Credentials are only ever read from the environment and never serialized.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use parley_core::provider::StreamOptions;
use parley_core::security::ApiKey;
use parley_engine::moderation::{ModerationConfig, DEFAULT_MODERATION_TIMEOUT, DEFAULT_REGION};
use parley_engine::{LoopConfig, DEFAULT_SINK_CAPACITY, DEFAULT_STEP_BUDGET};
use parley_telemetry::{LogFormat, TelemetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown log level: {0}")]
    LogLevel(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub moderation: ModerationSettings,
    pub logging: LoggingSettings,
    #[serde(skip)]
    pub anthropic_api_key: Option<ApiKey>,
    /// Moderation runs only when this is present.
    #[serde(skip)]
    pub moderation_api_key: Option<ApiKey>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub sink_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub default_model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub step_budget: u32,
    pub tool_timeout_ms: u64,
    pub base_url: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            default_model: None,
            system_prompt: None,
            max_tokens: None,
            step_budget: DEFAULT_STEP_BUDGET,
            tool_timeout_ms: 120_000,
            base_url: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModerationSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.into(),
            endpoint: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
        }
    }
}

impl Settings {
    /// Generation loop configuration derived from the model settings.
    /// The step budget is clamped to `1..=DEFAULT_STEP_BUDGET`.
    pub fn loop_config(&self) -> LoopConfig {
        let step_budget = self.model.step_budget.clamp(1, DEFAULT_STEP_BUDGET);
        if step_budget != self.model.step_budget {
            warn!(
                configured = self.model.step_budget,
                using = step_budget,
                "step budget out of range, clamping"
            );
        }
        LoopConfig {
            step_budget,
            tool_timeout: Duration::from_millis(self.model.tool_timeout_ms),
            stream_options: StreamOptions {
                max_tokens: self.model.max_tokens,
                ..Default::default()
            },
            system_prompt: self.model.system_prompt.clone(),
        }
    }

    /// `None` when no moderation credential is configured. The timeout may be
    /// lowered but never raised above [`DEFAULT_MODERATION_TIMEOUT`].
    pub fn moderation_config(&self) -> Option<ModerationConfig> {
        let key = self.moderation_api_key.clone()?;
        let configured = Duration::from_millis(self.moderation.timeout_ms);
        let timeout = configured.clamp(Duration::from_millis(1), DEFAULT_MODERATION_TIMEOUT);
        if timeout != configured {
            warn!(
                configured_ms = self.moderation.timeout_ms,
                using_ms = timeout.as_millis() as u64,
                "moderation timeout out of range, clamping"
            );
        }
        let mut config = ModerationConfig::new(key, &self.moderation.region).with_timeout(timeout);
        if let Some(endpoint) = &self.moderation.endpoint {
            config = config.with_endpoint(endpoint.clone());
        }
        Some(config)
    }

    pub fn log_level(&self) -> Result<tracing::Level, SettingsError> {
        tracing::Level::from_str(&self.logging.level)
            .map_err(|_| SettingsError::LogLevel(self.logging.level.clone()))
    }

    /// Falls back to `info` on an unknown level. Runs before the subscriber
    /// exists, so callers report [`Settings::log_level`] errors after init.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let log_level = self.log_level().unwrap_or(tracing::Level::INFO);
        let format = match self.logging.format.as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        };
        TelemetryConfig {
            log_level,
            format,
            ..Default::default()
        }
    }
}

/// Directory holding the settings file: `$PARLEY_HOME`, else `~/.parley`.
pub fn settings_home() -> PathBuf {
    if let Some(home) = std::env::var("PARLEY_HOME").ok().filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

pub fn settings_path() -> PathBuf {
    settings_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any variable source. Invalid values are ignored
/// with a warning, keeping the file or default value.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.u64_in("PARLEY_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("PARLEY_SINK_CAPACITY", 1, 65_536) {
        settings.server.sink_capacity = v as usize;
    }
    if let Some(v) = env.string("PARLEY_DEFAULT_MODEL") {
        settings.model.default_model = Some(v);
    }
    if let Some(v) = env.string("PARLEY_SYSTEM_PROMPT") {
        settings.model.system_prompt = Some(v);
    }
    if let Some(v) = env.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }

    if let Some(v) = env.string("ANTHROPIC_API_KEY") {
        settings.anthropic_api_key = Some(ApiKey::new(v));
    }
    if let Some(v) = env.string("ANTHROPIC_BASE_URL") {
        settings.model.base_url = Some(v);
    }

    if let Some(v) = env.string("MODERATION_API_KEY") {
        settings.moderation_api_key = Some(ApiKey::new(v));
    }
    if let Some(v) = env.string("MODERATION_REGION") {
        settings.moderation.region = v;
    }
    if let Some(v) = env.string("MODERATION_ENDPOINT") {
        settings.moderation.endpoint = Some(v);
    }
    if let Some(v) = env.u64_in(
        "MODERATION_TIMEOUT_MS",
        1,
        DEFAULT_MODERATION_TIMEOUT.as_millis() as u64,
    ) {
        settings.moderation.timeout_ms = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
