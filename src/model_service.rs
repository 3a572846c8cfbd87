use image::DynamicImage;
use std::{collections::HashMap, path::Path};
use thiserror::Error;

pub type ClassNames = HashMap<u32, String>;

/// A box as emitted by the model, in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to build input tensor: {0}")]
    Input(String),
    #[error("inference failed: {0}")]
    Run(String),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("session mutex poisoned: {0}")]
    Poisoned(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("YOLO model file '{path}' not found")]
    NotFound { path: String },
    #[error("Error loading YOLO model '{path}': {reason}")]
    Corrupt { path: String, reason: String },
}

impl LoadError {
    pub fn corrupt(path: &Path, reason: impl ToString) -> Self {
        LoadError::Corrupt {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A loaded detector. Inference must not mutate observable state, so a single
/// instance can serve concurrent callers.
pub trait ModelService: Send + Sync + 'static {
    fn class_names(&self) -> &ClassNames;

    /// Runs the forward pass and returns every detection whose confidence is
    /// above `min_confidence`, in the order the model emits them.
    fn predict(
        &self,
        image: &DynamicImage,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, InferenceError>;
}

pub trait ModelLoader: Send + Sync + 'static {
    type Model: ModelService;

    fn load(&self, path: &Path) -> Result<Self::Model, LoadError>;
}
