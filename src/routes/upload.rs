use super::{read_body, size_kb, ApiFailure, RequestTimer};
use crate::{model_service::ModelLoader, server::SharedState, validation::validate_jpeg};
use axum::{body::Body, extract::State, Json};
use serde::Serialize;
use tracing::instrument;

#[derive(Serialize)]
pub struct UploadImageInfo {
    filename: String,
    size_bytes: usize,
    size_kb: f64,
    format: &'static str,
}

#[derive(Serialize)]
pub struct UploadResponse {
    status: &'static str,
    message: &'static str,
    image_info: UploadImageInfo,
    processing_time: f64,
    server_timestamp: String,
    saved_to: String,
}

#[instrument(skip(state, body))]
pub async fn upload_image<L: ModelLoader>(
    State(state): State<SharedState<L>>,
    body: Body,
) -> Result<Json<UploadResponse>, ApiFailure> {
    let timer = RequestTimer::start();
    state.metrics.record_request("/upload-image");

    let image_bytes = read_body(body, state.upload_limits.max_bytes)
        .await
        .map_err(|e| timer.fail(e))?;
    let size_bytes = image_bytes.len();
    tracing::info!("Received image upload: {} bytes", size_bytes);

    validate_jpeg(&image_bytes, state.upload_limits).map_err(|e| timer.fail(e))?;

    let saved = state
        .image_store
        .save(&image_bytes)
        .await
        .map_err(|e| timer.fail(e))?;
    state.metrics.record_image_saved();
    tracing::info!("Image saved: {} ({} bytes)", saved.path.display(), size_bytes);

    Ok(Json(UploadResponse {
        status: "success",
        message: "Image received and saved successfully",
        image_info: UploadImageInfo {
            filename: saved.filename,
            size_bytes,
            size_kb: size_kb(size_bytes),
            format: "JPEG",
        },
        processing_time: timer.processing_time(),
        server_timestamp: timer.server_timestamp(),
        saved_to: saved.path.display().to_string(),
    }))
}
