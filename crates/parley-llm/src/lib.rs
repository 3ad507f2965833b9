pub mod converter;
pub mod models;
pub mod provider;
pub mod sse;

pub mod mock;

pub use mock::{MockFactory, MockProvider, MockResponse};
pub use models::{AnthropicFactory, ModelCatalog, ModelEntry, ProviderFactory, StaticCatalog};
pub use provider::AnthropicProvider;
