use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tether_core::{PipelineError, StoreError};
use thiserror::Error;
use tracing::error;

/// Errors returned by the REST handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("Attachment too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Upload failed: {0}")]
    Upload(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(message) => ApiError::Validation(message),
            PipelineError::Store(e) => ApiError::Store(e),
        }
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Store(_) | ApiError::Upload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Store(e) => {
                error!(error = %e, "Store failure");
                crate::metrics::record_error("store");
                "Error sending message".to_string()
            }
            ApiError::Upload(e) => {
                error!(error = %e, "Upload failure");
                crate::metrics::record_error("upload");
                "Error storing attachment".to_string()
            }
            _ => self.to_string(),
        };

        (status, axum::Json(serde_json::json!({ "message": message }))).into_response()
    }
}
