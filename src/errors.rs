use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::store::PersistenceError;
use crate::services::calibration::CalibrationError;
use crate::services::ingest::SchemaError;
use crate::services::pipeline::PipelineError;
use crate::services::subscribe::SubscribeError;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Persistence(err) if !err.is_transient() => {
                tracing::error!("Persistence error: {:?}", err);
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            AppError::Persistence(err) => {
                tracing::error!("Persistence error: {:?}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Storage temporarily unavailable".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<SchemaError> for AppError {
    fn from(err: SchemaError) -> Self {
        AppError::BadRequest(format!("Schema error: {}", err))
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Schema(e) => e.into(),
            PipelineError::OutOfOrder { .. } => AppError::Conflict(err.to_string()),
            PipelineError::NodeUnavailable(_) => AppError::Unavailable(err.to_string()),
        }
    }
}

impl From<SubscribeError> for AppError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::Schema(e) => e.into(),
            SubscribeError::Pipeline(e) => e.into(),
            SubscribeError::Closed => AppError::Unavailable(err.to_string()),
        }
    }
}

impl From<CalibrationError> for AppError {
    fn from(err: CalibrationError) -> Self {
        match err {
            CalibrationError::InvalidCalibrationData { .. } | CalibrationError::PoorFit { .. } => {
                AppError::Unprocessable(err.to_string())
            }
            CalibrationError::Import(msg) => AppError::BadRequest(msg),
            CalibrationError::InProgress(_) => AppError::Conflict(err.to_string()),
            CalibrationError::Persistence(e) => AppError::Persistence(e),
            CalibrationError::Aborted(msg) => AppError::InternalError(msg),
        }
    }
}
