use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::{net::SocketAddr, time::Instant};

/// Logs the request line with the client address, then the outcome.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let started = Instant::now();
    tracing::info!("{} {} from {}", method, path, client);

    let response = next.run(req).await;

    tracing::info!(
        "{} {} -> {} in {:.3}s",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64()
    );

    response
}
