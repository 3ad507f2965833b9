use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Errors returned before any event stream is created.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no models available")]
    NoModels,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "unknown_model",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoModels => "no_models",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownModel(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoModels => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
