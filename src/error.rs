use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Every way a request can fail at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Question is required")]
    MissingQuestion,

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("MODEL_FILE_ID is not set; cannot download the model")]
    ArtifactIdMissing,

    #[error("Failed to download model: {0}")]
    Download(String),

    #[error("Error loading model: {0}")]
    Load(String),

    #[error("Error generating answer: {0}")]
    Generation(String),
}

impl ServeError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingQuestion | Self::InvalidBody(_) | Self::InvalidParameter { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::ArtifactIdMissing | Self::Download(_) | Self::Load(_) | Self::Generation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable kind, returned next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingQuestion | Self::InvalidBody(_) | Self::InvalidParameter { .. } => {
                "invalid_input"
            }
            Self::ArtifactIdMissing => "artifact_unavailable",
            Self::Download(_) => "download_failed",
            Self::Load(_) => "load_failed",
            Self::Generation(_) => "generation_failed",
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (self.status(), body).into_response()
    }
}
