mod detect;
mod error;
mod health;
mod metrics;
mod model;
mod upload;

pub use error::{ApiError, ApiFailure};

use crate::{model_service::ModelLoader, server::SharedState, validation::PayloadError};
use axum::{
    body::{Body, Bytes},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Local};
use http_body_util::LengthLimitError;
use std::time::Instant;

pub fn api_routes<L: ModelLoader>() -> Router<SharedState<L>> {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::healthcheck))
        .route("/yolo-detect", post(detect::yolo_detect::<L>))
        .route("/upload-image", post(upload::upload_image::<L>))
        .route("/model/status", get(model::model_status::<L>))
        .route("/model/reload", post(model::reload_model::<L>))
        .route("/metrics", get(metrics::metrics_handler::<L>))
}

/// Wall clock and local timestamp captured when a request arrives.
pub(crate) struct RequestTimer {
    started: Instant,
    received_at: DateTime<Local>,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            received_at: Local::now(),
        }
    }

    pub fn processing_time(&self) -> f64 {
        round3(self.started.elapsed().as_secs_f64())
    }

    pub fn server_timestamp(&self) -> String {
        iso_timestamp(&self.received_at)
    }

    pub fn fail(&self, error: impl Into<ApiError>) -> ApiFailure {
        ApiFailure {
            error: error.into(),
            processing_time: self.processing_time(),
        }
    }
}

pub(crate) fn iso_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.).round_ties_even() / 1000.
}

pub(crate) fn size_kb(size_bytes: usize) -> f64 {
    (size_bytes as f64 / 1024. * 10.).round_ties_even() / 10.
}

/// Buffers the whole body, failing with `TooLarge` as soon as it exceeds
/// `max_bytes`.
pub(crate) async fn read_body(body: Body, max_bytes: usize) -> Result<Bytes, PayloadError> {
    axum::body::to_bytes(body, max_bytes).await.map_err(|err| {
        let source = err.into_inner();
        if source.downcast_ref::<LengthLimitError>().is_some() {
            PayloadError::TooLarge { max: max_bytes }
        } else {
            PayloadError::Unreadable(source.to_string())
        }
    })
}
