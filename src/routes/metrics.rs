use super::{ApiError, ApiFailure, RequestTimer};
use crate::{model_service::ModelLoader, server::SharedState};
use axum::{extract::State, http::header, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler<L: ModelLoader>(
    State(state): State<SharedState<L>>,
) -> Result<impl IntoResponse, ApiFailure> {
    let timer = RequestTimer::start();
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| timer.fail(ApiError::Metrics(e.to_string())))?;

    let body = String::from_utf8(buffer)
        .map_err(|e| timer.fail(ApiError::Metrics(e.to_string())))?;

    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], body))
}
