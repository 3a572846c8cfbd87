use super::{iso_timestamp, read_body, round3, size_kb, ApiError, ApiFailure, RequestTimer};
use crate::{
    detection::Detection, model_service::ModelLoader, server::SharedState,
    validation::validate_jpeg,
};
use axum::{body::Body, extract::State, Json};
use serde::Serialize;
use std::time::Instant;
use tracing::instrument;

#[derive(Serialize)]
pub struct Dimensions {
    width: u32,
    height: u32,
}

#[derive(Serialize)]
pub struct DetectImageInfo {
    size_bytes: usize,
    size_kb: f64,
    dimensions: Dimensions,
    format: &'static str,
}

#[derive(Serialize)]
pub struct DetectionResults {
    total_objects: usize,
    objects_detected: Vec<Detection>,
    detection_time: f64,
}

#[derive(Serialize)]
pub struct DetectResponse {
    status: &'static str,
    message: &'static str,
    image_info: DetectImageInfo,
    detection_results: DetectionResults,
    processing_time: f64,
    server_timestamp: String,
}

#[instrument(skip(state, body))]
pub async fn yolo_detect<L: ModelLoader>(
    State(state): State<SharedState<L>>,
    body: Body,
) -> Result<Json<DetectResponse>, ApiFailure> {
    let timer = RequestTimer::start();
    state.metrics.record_request("/yolo-detect");

    let image_bytes = read_body(body, state.detect_limits.max_bytes)
        .await
        .map_err(|e| timer.fail(e))?;
    let size_bytes = image_bytes.len();
    tracing::info!("Received image for detection: {} bytes", size_bytes);

    validate_jpeg(&image_bytes, state.detect_limits).map_err(|e| timer.fail(e))?;

    let model = match state.model_manager.ensure_loaded().await {
        Ok(model) => model,
        Err(e) => {
            let status = state.model_manager.status();
            return Err(timer.fail(ApiError::ModelNotLoaded {
                details: e.to_string(),
                last_attempt: status.last_load_attempt.as_ref().map(iso_timestamp),
            }));
        }
    };

    let detection_started = Instant::now();
    let result = state
        .detection_service
        .detect(image_bytes, model)
        .await
        .map_err(|e| timer.fail(e))?;
    let detection_elapsed = detection_started.elapsed();

    state
        .metrics
        .record_detection_duration(detection_elapsed.as_millis() as u64);
    for detection in &result.detections {
        state.metrics.record_object(&detection.label);
    }

    if result.total_count() == 0 {
        tracing::info!("YOLO detection complete: no objects detected");
    } else {
        tracing::info!(
            "YOLO detection complete: {} objects ({})",
            result.total_count(),
            result.summary()
        );
    }

    Ok(Json(DetectResponse {
        status: "success",
        message: "YOLO detection completed successfully",
        image_info: DetectImageInfo {
            size_bytes,
            size_kb: size_kb(size_bytes),
            dimensions: Dimensions {
                width: result.image_width,
                height: result.image_height,
            },
            format: "JPEG",
        },
        detection_results: DetectionResults {
            total_objects: result.total_count(),
            detection_time: round3(detection_elapsed.as_secs_f64()),
            objects_detected: result.detections,
        },
        processing_time: timer.processing_time(),
        server_timestamp: timer.server_timestamp(),
    }))
}
