use super::{iso_timestamp, ApiError, ApiFailure, RequestTimer};
use crate::{model_manager::ModelStatus, model_service::ModelLoader, server::SharedState};
use axum::{extract::State, Json};
use serde::Serialize;
use tracing::instrument;

#[derive(Serialize)]
pub struct ModelStatusBody {
    loaded: bool,
    load_error: Option<String>,
    last_load_attempt: Option<String>,
    class_count: usize,
    model_path: String,
}

impl From<ModelStatus> for ModelStatusBody {
    fn from(status: ModelStatus) -> Self {
        Self {
            loaded: status.loaded,
            load_error: status.load_error,
            last_load_attempt: status.last_load_attempt.as_ref().map(iso_timestamp),
            class_count: status.class_count,
            model_path: status.model_path.display().to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct ReloadResponse {
    status: &'static str,
    message: &'static str,
    model: ModelStatusBody,
}

pub async fn model_status<L: ModelLoader>(
    State(state): State<SharedState<L>>,
) -> Json<ModelStatusBody> {
    Json(state.model_manager.status().into())
}

#[instrument(skip(state))]
pub async fn reload_model<L: ModelLoader>(
    State(state): State<SharedState<L>>,
) -> Result<Json<ReloadResponse>, ApiFailure> {
    let timer = RequestTimer::start();
    state.metrics.record_request("/model/reload");

    let outcome = state.model_manager.reload().await;
    let status = state.model_manager.status();

    match outcome {
        Ok(()) => Ok(Json(ReloadResponse {
            status: "success",
            message: "YOLO model reloaded successfully",
            model: status.into(),
        })),
        Err(e) => Err(timer.fail(ApiError::ModelNotLoaded {
            details: e.to_string(),
            last_attempt: status.last_load_attempt.as_ref().map(iso_timestamp),
        })),
    }
}
