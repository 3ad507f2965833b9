pub mod config;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod server;

pub use config::{Settings, SettingsError};
pub use error::ApiError;
pub use orchestrator::{ChatRequest, RequestOrchestrator, REFUSAL_TEXT};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
