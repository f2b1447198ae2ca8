use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::validation::FieldError;
use serde_json::json;
use thiserror::Error;

/// Failures of the ingestion and timelapse pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("metadata parse error: {0}")]
    MetadataParse(String),

    #[error("validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("insufficient frames: need at least {required}, found {found}")]
    InsufficientFrames { required: usize, found: usize },

    #[error("failed to fetch frame {reference}: {reason}")]
    FrameFetch { reference: String, reason: String },

    #[error("encoder not found at {0}")]
    EncoderNotFound(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("repository error: {0}")]
    Repository(String),
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    /// Single-field validation failure
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn repository(err: impl std::fmt::Display) -> Self {
        Self::Repository(err.to_string())
    }

    /// Client-side faults are reported back in detail; everything else is
    /// logged server-side and surfaced generically.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Self::MetadataParse(_)
                | Self::Validation(_)
                | Self::UnsupportedMedia(_)
                | Self::InsufficientFrames { .. }
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Repository(err.to_string())
    }
}

/// HTTP-facing error
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        details: Vec<FieldError>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
            details: Vec::new(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, details) = match self {
            ApiError::BadRequest { message, details } => {
                (StatusCode::BAD_REQUEST, message, details)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, Vec::new()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, Vec::new()),
            ApiError::UnsupportedMediaType(msg) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg, Vec::new())
            }
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg, Vec::new()),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, Vec::new()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, Vec::new()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, Vec::new()),
        };

        let body = Json(json!({
            "error": message,
            "details": details,
        }));

        (status, body).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        if !err.is_client_fault() {
            tracing::error!(error = %err, "request failed");
        }

        match err {
            PipelineError::MetadataParse(msg) => ApiError::BadRequest {
                message: "failed to parse meta JSON".to_string(),
                details: vec![FieldError::new("meta", msg)],
            },
            PipelineError::Validation(details) => ApiError::BadRequest {
                message: "validation failed".to_string(),
                details,
            },
            PipelineError::UnsupportedMedia(msg) => ApiError::UnsupportedMediaType(msg),
            e @ PipelineError::InsufficientFrames { .. } => ApiError::Conflict(e.to_string()),
            PipelineError::FrameFetch { .. } => {
                ApiError::BadGateway("failed to fetch one or more frames".to_string())
            }
            PipelineError::Cancelled => ApiError::Unavailable("operation cancelled".to_string()),
            PipelineError::EncoderNotFound(_) | PipelineError::EncodingFailed(_) => {
                ApiError::internal("timelapse generation failed")
            }
            PipelineError::Storage(_) | PipelineError::Repository(_) => {
                ApiError::internal("internal server error")
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "request failed");
        ApiError::internal("internal server error")
    }
}
