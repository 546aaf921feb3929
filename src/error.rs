//! # Error Handling
//!
//! Two error families live here:
//! - **AppError**: what HTTP handlers return; converted into JSON error responses
//! - **PipelineError**: what the frame-processing core returns; each variant has
//!   a fixed recovery policy in the session pipeline
//!
//! ## Pipeline Recovery Policy:
//! - **Decode**: the frame is answered with an `error` message, session state untouched
//! - **ModelUnavailable / Inference**: the frame is answered by the fallback classifier
//! - **DeliveryGone**: the session is forgotten and its recurrent state dropped
//! - **SessionStateCorruption**: the session is reset to uninitialized

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors produced while processing one frame or one control message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// Inbound audio could not be decoded (malformed base64).
    #[error("Failed to decode audio frame: {0}")]
    Decode(String),

    /// The model could not be loaded from its artifact source.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// A loaded model failed while running a frame.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// The remote endpoint for a session is no longer reachable.
    #[error("Delivery target for session {0} is gone")]
    DeliveryGone(String),

    /// Stored recurrent state does not match what the model expects.
    #[error("Recurrent state for session {session_id} is corrupt: {reason}")]
    SessionStateCorruption { session_id: String, reason: String },
}

impl PipelineError {
    /// Whether the orchestrator should answer this frame with the fallback classifier.
    pub fn routes_to_fallback(&self) -> bool {
        matches!(
            self,
            PipelineError::ModelUnavailable(_)
                | PipelineError::Inference(_)
                | PipelineError::SessionStateCorruption { .. }
        )
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        PipelineError::Inference(err.to_string())
    }
}

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: The model is not usable right now (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Port must be greater than 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.clone()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(_) => AppError::BadRequest(err.to_string()),
            PipelineError::ModelUnavailable(_) | PipelineError::Inference(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            PipelineError::DeliveryGone(_) => AppError::NotFound(err.to_string()),
            PipelineError::SessionStateCorruption { .. } => AppError::Internal(err.to_string()),
        }
    }
}
