use crate::{
    config::{Config, DetectionConfig, UploadConfig},
    detection::DetectionService,
    middleware::log_requests,
    model_manager::ModelManager,
    model_service::{LoadError, ModelLoader},
    ort_service::OrtModelLoader,
    routes::api_routes,
    storage::ImageStore,
    telemetry::Metrics,
    validation::ImageLimits,
};
use axum::{middleware, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{net::SocketAddr, path::Path, sync::Arc};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;

pub struct SharedState<L: ModelLoader> {
    pub model_manager: Arc<ModelManager<L>>,
    pub detection_service: DetectionService,
    pub image_store: ImageStore,
    pub detect_limits: ImageLimits,
    pub upload_limits: ImageLimits,
    pub metrics: Arc<Metrics>,
}

impl<L: ModelLoader> Clone for SharedState<L> {
    fn clone(&self) -> Self {
        Self {
            model_manager: self.model_manager.clone(),
            detection_service: self.detection_service.clone(),
            image_store: self.image_store.clone(),
            detect_limits: self.detect_limits,
            upload_limits: self.upload_limits,
            metrics: self.metrics.clone(),
        }
    }
}

impl<L: ModelLoader> SharedState<L> {
    pub fn new(
        model_manager: Arc<ModelManager<L>>,
        detection: &DetectionConfig,
        upload: &UploadConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            model_manager,
            detection_service: DetectionService::new(detection),
            image_store: ImageStore::new(&upload.directory, upload.file_prefix.clone()),
            detect_limits: ImageLimits::new(detection.min_image_bytes, detection.max_image_bytes),
            upload_limits: ImageLimits::new(upload.min_image_bytes, upload.max_image_bytes),
            metrics,
        }
    }
}

pub fn build_router<L: ModelLoader>(state: SharedState<L>) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(CorsLayer::permissive())
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<L: ModelLoader>(state: SharedState<L>, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = build_router(state);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
        })
        .await?;

        Ok(())
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);

    let model_path = config.model.get_path();
    let model_manager = Arc::new(
        ModelManager::new(OrtModelLoader::new(&config.model), &model_path)
            .with_metrics(metrics.clone()),
    );

    match model_manager.reload().await {
        Ok(()) => tracing::info!("YOLO model ready"),
        Err(e @ LoadError::NotFound { .. }) => {
            tracing::error!("{}", e);
            log_available_models(&config.model.model_dir);
        }
        Err(e) => tracing::error!("Failed to load YOLO model: {}", e),
    }

    let state = SharedState::new(model_manager, &config.detection, &config.upload, metrics);
    let server = HttpServer::new(state, &config).await?;
    server.run().await?;

    Ok(())
}

fn log_available_models(model_dir: &Path) {
    let entries = match std::fs::read_dir(model_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Cannot list model directory {}: {}", model_dir.display(), e);
            return;
        }
    };

    let models: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "onnx"))
        .map(|path| path.display().to_string())
        .collect();

    if models.is_empty() {
        tracing::error!("No .onnx files found in {}", model_dir.display());
    } else {
        tracing::error!("Available .onnx files: {}", models.join(", "));
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
