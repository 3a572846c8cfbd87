use crate::{detection::DetectionError, storage::StorageError, validation::PayloadError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("YOLO model not loaded")]
    ModelNotLoaded {
        details: String,
        last_attempt: Option<String>,
    },
    #[error("{}", detection_message(.0))]
    Detection(#[from] DetectionError),
    #[error("Save error: {0}")]
    Storage(#[from] StorageError),
    #[error("Metrics error: {0}")]
    Metrics(String),
}

fn detection_message(err: &DetectionError) -> String {
    match err {
        DetectionError::Decode(_) => "Failed to decode image".to_string(),
        other => format!("YOLO detection error: {}", other),
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Payload(PayloadError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Payload(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelNotLoaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Detection(_) | ApiError::Storage(_) | ApiError::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_attempt: Option<Option<String>>,
    processing_time: f64,
}

/// An [`ApiError`] stamped with the time spent on the request so far.
#[derive(Debug)]
pub struct ApiFailure {
    pub error: ApiError,
    pub processing_time: f64,
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {} ({})", self.error, status);
        } else {
            tracing::warn!("Request rejected: {} ({})", self.error, status);
        }

        let (details, last_attempt) = match &self.error {
            ApiError::ModelNotLoaded {
                details,
                last_attempt,
            } => (Some(details.clone()), Some(last_attempt.clone())),
            _ => (None, None),
        };

        let body = ErrorBody {
            status: "error",
            error: self.error.to_string(),
            details,
            last_attempt,
            processing_time: self.processing_time,
        };

        (status, Json(body)).into_response()
    }
}
