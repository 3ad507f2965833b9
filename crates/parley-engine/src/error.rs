use parley_core::errors::GatewayError;

use crate::sink::SinkClosed;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    SinkClosed(#[from] SinkClosed),
}

impl EngineError {
    /// Errors that mean the client went away rather than something failing.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::SinkClosed(_))
    }
}
