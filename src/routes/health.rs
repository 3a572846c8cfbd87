use axum::{response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Online {
    status: &'static str,
    message: &'static str,
}

#[derive(Serialize)]
pub struct Status {
    status: &'static str,
}

pub async fn root() -> impl IntoResponse {
    Json(Online {
        status: "online",
        message: "Image Processing API is running",
    })
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(Status { status: "ok" })
}
