use crate::{
    model_service::{LoadError, ModelLoader, ModelService},
    telemetry::Metrics,
};
use chrono::{DateTime, Local};
use image::{DynamicImage, RgbImage};
use parking_lot::RwLock;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;

const SMOKE_TEST_SIZE: u32 = 640;
const SMOKE_TEST_CONFIDENCE: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub loaded: bool,
    pub load_error: Option<String>,
    pub last_load_attempt: Option<DateTime<Local>>,
    pub class_count: usize,
    pub model_path: PathBuf,
}

struct ModelState<M> {
    model: Option<Arc<M>>,
    load_error: Option<LoadError>,
    last_load_attempt: Option<DateTime<Local>>,
    attempts: u64,
}

/// Owns the detector and its load status.
///
/// Loads are serialized through `load_guard`. The state lock is only held
/// to swap values in and out, so `status` and `current` never wait on a load
/// in progress or on running inference.
pub struct ModelManager<L: ModelLoader> {
    loader: Arc<L>,
    model_path: PathBuf,
    state: RwLock<ModelState<L::Model>>,
    load_guard: Mutex<()>,
    metrics: Option<Arc<Metrics>>,
}

impl<L: ModelLoader> ModelManager<L> {
    pub fn new(loader: L, model_path: impl Into<PathBuf>) -> Self {
        Self {
            loader: Arc::new(loader),
            model_path: model_path.into(),
            state: RwLock::new(ModelState {
                model: None,
                load_error: None,
                last_load_attempt: None,
                attempts: 0,
            }),
            load_guard: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn current(&self) -> Option<Arc<L::Model>> {
        self.state.read().model.clone()
    }

    pub fn status(&self) -> ModelStatus {
        let state = self.state.read();
        ModelStatus {
            loaded: state.model.is_some(),
            load_error: state.load_error.as_ref().map(|e| e.to_string()),
            last_load_attempt: state.last_load_attempt,
            class_count: state
                .model
                .as_ref()
                .map(|model| model.class_names().len())
                .unwrap_or(0),
            model_path: self.model_path.clone(),
        }
    }

    pub async fn load(&self, path: &Path) -> Result<(), LoadError> {
        let _guard = self.load_guard.lock().await;
        self.load_locked(path).await.map(|_| ())
    }

    pub async fn reload(&self) -> Result<(), LoadError> {
        self.load(&self.model_path).await
    }

    /// Returns the loaded model, making at most one load attempt when none is
    /// loaded. Callers that queue behind an attempt in progress share its
    /// outcome instead of starting their own.
    pub async fn ensure_loaded(&self) -> Result<Arc<L::Model>, LoadError> {
        let seen = {
            let state = self.state.read();
            if let Some(model) = &state.model {
                return Ok(model.clone());
            }
            state.attempts
        };

        let _guard = self.load_guard.lock().await;
        {
            let state = self.state.read();
            if state.attempts != seen {
                return match &state.model {
                    Some(model) => Ok(model.clone()),
                    None => Err(state.load_error.clone().unwrap_or_else(|| {
                        LoadError::NotFound {
                            path: self.model_path.display().to_string(),
                        }
                    })),
                };
            }
        }

        tracing::warn!("YOLO model not loaded, attempting to reload");
        self.load_locked(&self.model_path).await
    }

    async fn load_locked(&self, path: &Path) -> Result<Arc<L::Model>, LoadError> {
        let attempted_at = Local::now();
        let loader = self.loader.clone();
        let owned_path = path.to_path_buf();

        tracing::info!("Loading YOLO model from {}", path.display());
        let outcome =
            tokio::task::spawn_blocking(move || load_and_smoke_test(loader.as_ref(), &owned_path))
                .await
                .unwrap_or_else(|e| Err(LoadError::corrupt(path, format!("load task failed: {}", e))));

        if let Some(metrics) = &self.metrics {
            metrics.record_model_load(outcome.is_ok());
        }

        let mut state = self.state.write();
        state.attempts += 1;
        state.last_load_attempt = Some(attempted_at);
        match outcome {
            Ok(model) => {
                let model = Arc::new(model);
                state.model = Some(model.clone());
                state.load_error = None;
                tracing::info!("YOLO model loaded and tested successfully from {}", path.display());
                Ok(model)
            }
            Err(err) => {
                state.model = None;
                state.load_error = Some(err.clone());
                tracing::error!("{}", err);
                Err(err)
            }
        }
    }
}

fn load_and_smoke_test<L: ModelLoader>(loader: &L, path: &Path) -> Result<L::Model, LoadError> {
    let model = loader.load(path)?;

    let blank = DynamicImage::ImageRgb8(RgbImage::new(SMOKE_TEST_SIZE, SMOKE_TEST_SIZE));
    model
        .predict(&blank, SMOKE_TEST_CONFIDENCE)
        .map_err(|e| LoadError::corrupt(path, format!("smoke test inference failed: {}", e)))?;

    let mut labels: Vec<_> = model.class_names().iter().collect();
    labels.sort_by_key(|(id, _)| **id);
    tracing::info!(
        "Model has {} classes: {:?}",
        labels.len(),
        labels.iter().map(|(_, name)| name.as_str()).collect::<Vec<_>>()
    );

    Ok(model)
}
