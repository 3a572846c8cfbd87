mod middleware;
mod server;

pub mod config;
pub mod detection;
pub mod model_manager;
pub mod model_service;
pub mod ort_service;
pub mod routes;
pub mod storage;
pub mod telemetry;
pub mod validation;

pub use server::{build_router, start_server, SharedState};
