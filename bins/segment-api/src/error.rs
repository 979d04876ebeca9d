use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use segment_common::types::ErrorResponse;

use crate::collector::CollectError;
use crate::staging::StagingError;

/// Every way a segmentation request can fail.
///
/// Each variant knows its HTTP status and whether diagnostic logs exist;
/// logs are only present once the worker has actually run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No `file` field in the upload
    #[error("No file uploaded.")]
    Validation,

    /// The multipart body itself could not be read
    #[error("Malformed upload: {0}")]
    BadUpload(String),

    /// The body went past the configured upload limit
    #[error("Upload too large: {0}")]
    TooLarge(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    /// The worker could not be launched or exited non-zero
    #[error("Error running segmentation: {reason}")]
    Worker { reason: String, logs: String },

    #[error("Segmentation timed out after {elapsed_ms}ms")]
    WorkerTimeout { elapsed_ms: u64, logs: String },

    /// The worker exited zero but its artifacts could not be listed
    #[error("Error reading segmentation results: {source}")]
    Collect {
        #[source]
        source: CollectError,
        logs: String,
    },
}

impl PipelineError {
    /// Classify a multipart read failure; the body limit surfaces here too.
    pub fn from_multipart(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            PipelineError::TooLarge(e.to_string())
        } else {
            PipelineError::BadUpload(e.to_string())
        }
    }

    /// Stable label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation => "validation",
            PipelineError::BadUpload(_) => "bad_upload",
            PipelineError::TooLarge(_) => "too_large",
            PipelineError::Staging(_) => "staging",
            PipelineError::Worker { .. } => "worker",
            PipelineError::WorkerTimeout { .. } => "worker_timeout",
            PipelineError::Collect { .. } => "result",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation | PipelineError::BadUpload(_) => StatusCode::BAD_REQUEST,
            PipelineError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::WorkerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Staging(_)
            | PipelineError::Worker { .. }
            | PipelineError::Collect { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rejections caused by the request itself, as opposed to server faults
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    fn public_message(&self) -> &'static str {
        match self {
            PipelineError::Validation => "No file uploaded.",
            PipelineError::BadUpload(_) => "Malformed upload.",
            PipelineError::TooLarge(_) => "Upload too large.",
            PipelineError::Staging(_) => "Error preparing segmentation input",
            PipelineError::Worker { .. } => "Error running segmentation",
            PipelineError::WorkerTimeout { .. } => "Segmentation timed out",
            PipelineError::Collect { .. } => "Error reading segmentation results",
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();

        match self {
            // Client errors are plain text; nothing ran, so there are no logs.
            PipelineError::Validation
            | PipelineError::BadUpload(_)
            | PipelineError::TooLarge(_) => (status, message).into_response(),
            PipelineError::Staging(_) => (
                status,
                Json(ErrorResponse {
                    error: message.to_string(),
                    logs: String::new(),
                }),
            )
                .into_response(),
            PipelineError::Worker { logs, .. }
            | PipelineError::WorkerTimeout { logs, .. }
            | PipelineError::Collect { logs, .. } => (
                status,
                Json(ErrorResponse {
                    error: message.to_string(),
                    logs,
                }),
            )
                .into_response(),
        }
    }
}
