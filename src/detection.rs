use crate::{
    config::DetectionConfig,
    model_service::{InferenceError, ModelService, RawDetection},
};
use bytes::Bytes;
use image::{GenericImageView, ImageFormat};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("detection {index} has box {bbox:?} outside a {width}x{height} image")]
    BoxOutOfBounds {
        index: usize,
        bbox: PixelBox,
        width: u32,
        height: u32,
    },
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("detection task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
    pub width: i64,
    pub height: i64,
}

impl PixelBox {
    /// Extents are rounded from the unrounded corners, so `width` may differ
    /// from `x2 - x1` by one.
    fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: round_half_even(x1 as f64),
            y1: round_half_even(y1 as f64),
            x2: round_half_even(x2 as f64),
            y2: round_half_even(y2 as f64),
            width: round_half_even((x2 - x1) as f64),
            height: round_half_even((y2 - y1) as f64),
        }
    }

    fn fits(&self, width: u32, height: u32) -> bool {
        let (width, height) = (width as i64, height as i64);
        self.x1 >= 0
            && self.y1 >= 0
            && self.x2 >= self.x1
            && self.y2 >= self.y1
            && self.width >= 0
            && self.height >= 0
            && self.x2 <= width
            && self.y2 <= height
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "object")]
    pub label: String,
    #[serde(rename = "confidence")]
    pub confidence_percent: f64,
    #[serde(rename = "bounding_box")]
    pub bbox: PixelBox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub image_width: u32,
    pub image_height: u32,
}

impl DetectionResult {
    pub fn total_count(&self) -> usize {
        self.detections.len()
    }

    /// `"2x carrot, 1x tomato"`, in order of first appearance.
    pub fn summary(&self) -> String {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for detection in &self.detections {
            match counts.iter_mut().find(|(label, _)| *label == detection.label) {
                Some((_, count)) => *count += 1,
                None => counts.push((&detection.label, 1)),
            }
        }
        counts
            .iter()
            .map(|(label, count)| format!("{}x {}", count, label))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn round_half_even(value: f64) -> i64 {
    value.round_ties_even() as i64
}

/// `0.87349` -> `87.3`
fn confidence_percent(probability: f32) -> f64 {
    (probability as f64 * 1000.).round_ties_even() / 10.
}

#[derive(Debug, Clone)]
pub struct DetectionService {
    confidence_threshold: f32,
    inference_timeout: Duration,
}

impl DetectionService {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            inference_timeout: config.get_inference_timeout(),
        }
    }

    /// Decodes and runs inference on the blocking pool. An image without
    /// any detections is a success with an empty list.
    #[instrument(skip(self, image_bytes, model), fields(size = image_bytes.len()))]
    pub async fn detect<M: ModelService>(
        &self,
        image_bytes: Bytes,
        model: Arc<M>,
    ) -> Result<DetectionResult, DetectionError> {
        let threshold = self.confidence_threshold;
        let task = tokio::task::spawn_blocking(move || {
            run_detection(&image_bytes, model.as_ref(), threshold)
        });

        match tokio::time::timeout(self.inference_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(DetectionError::Join(e.to_string())),
            Err(_) => Err(DetectionError::Timeout(self.inference_timeout)),
        }
    }
}

fn run_detection<M: ModelService + ?Sized>(
    image_bytes: &[u8],
    model: &M,
    confidence_threshold: f32,
) -> Result<DetectionResult, DetectionError> {
    let image = image::load_from_memory_with_format(image_bytes, ImageFormat::Jpeg)
        .map_err(DetectionError::Decode)?;
    let (image_width, image_height) = image.dimensions();

    let raw = model.predict(&image, confidence_threshold)?;
    tracing::debug!("Model returned {} detections", raw.len());

    let detections = raw
        .iter()
        .enumerate()
        .map(|(index, detection)| {
            to_detection(index, detection, model, image_width, image_height)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DetectionResult {
        detections,
        image_width,
        image_height,
    })
}

fn to_detection<M: ModelService + ?Sized>(
    index: usize,
    raw: &RawDetection,
    model: &M,
    image_width: u32,
    image_height: u32,
) -> Result<Detection, DetectionError> {
    let label = match model.class_names().get(&raw.class_id) {
        Some(name) => name.clone(),
        None => {
            tracing::warn!(
                "Class id {} is missing from the model labels, check the labels match the model",
                raw.class_id
            );
            format!("class_{}", raw.class_id)
        }
    };

    let bbox = PixelBox::from_corners(raw.x1, raw.y1, raw.x2, raw.y2);
    if !bbox.fits(image_width, image_height) {
        return Err(DetectionError::BoxOutOfBounds {
            index,
            bbox,
            width: image_width,
            height: image_height,
        });
    }

    Ok(Detection {
        label,
        confidence_percent: confidence_percent(raw.confidence).clamp(0., 100.),
        bbox,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::ClassNames;
    use image::{codecs::jpeg::JpegEncoder, DynamicImage, RgbImage};

    struct FixedModel {
        class_names: ClassNames,
        detections: Vec<RawDetection>,
        delay: Duration,
    }

    impl FixedModel {
        fn new(detections: Vec<RawDetection>) -> Self {
            Self {
                class_names: ClassNames::from([
                    (0, "tomato".to_string()),
                    (1, "carrot".to_string()),
                ]),
                detections,
                delay: Duration::ZERO,
            }
        }
    }

    impl ModelService for FixedModel {
        fn class_names(&self) -> &ClassNames {
            &self.class_names
        }

        fn predict(
            &self,
            _image: &DynamicImage,
            min_confidence: f32,
        ) -> Result<Vec<RawDetection>, InferenceError> {
            std::thread::sleep(self.delay);
            Ok(self
                .detections
                .iter()
                .filter(|d| d.confidence > min_confidence)
                .copied()
                .collect())
        }
    }

    fn jpeg(width: u32, height: u32) -> Bytes {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, 90)
            .encode_image(&img)
            .unwrap();
        Bytes::from(buf)
    }

    fn raw(class_id: u32, confidence: f32, corners: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            x1: corners[0],
            y1: corners[1],
            x2: corners[2],
            y2: corners[3],
        }
    }

    fn service() -> DetectionService {
        DetectionService::new(&DetectionConfig::default())
    }

    #[tokio::test]
    async fn test_zero_detections_is_success() {
        let model = Arc::new(FixedModel::new(vec![]));

        let result = service().detect(jpeg(64, 48), model).await.unwrap();

        assert_eq!(result.total_count(), 0);
        assert!(result.detections.is_empty());
        assert_eq!((result.image_width, result.image_height), (64, 48));
    }

    #[tokio::test]
    async fn test_maps_labels_confidence_and_boxes() {
        let model = Arc::new(FixedModel::new(vec![
            raw(1, 0.87349, [10.4, 20.5, 30.6, 40.5]),
            raw(0, 0.5, [0., 0., 64., 48.]),
            raw(0, 0.1, [1., 1., 2., 2.]),
        ]));

        let result = service().detect(jpeg(64, 48), model).await.unwrap();

        assert_eq!(result.total_count(), 2);
        let first = &result.detections[0];
        assert_eq!(first.label, "carrot");
        assert_eq!(first.confidence_percent, 87.3);
        assert_eq!(
            first.bbox,
            PixelBox {
                x1: 10,
                y1: 20,
                x2: 31,
                y2: 40,
                width: 20,
                height: 20
            }
        );
        assert_eq!(result.detections[1].label, "tomato");
        assert_eq!(result.summary(), "1x carrot, 1x tomato");
    }

    #[tokio::test]
    async fn test_preserves_model_order() {
        let model = Arc::new(FixedModel::new(vec![
            raw(0, 0.4, [0., 0., 5., 5.]),
            raw(0, 0.9, [5., 5., 10., 10.]),
            raw(1, 0.6, [10., 10., 15., 15.]),
        ]));

        let result = service().detect(jpeg(32, 32), model).await.unwrap();

        let confidences: Vec<_> = result
            .detections
            .iter()
            .map(|d| d.confidence_percent)
            .collect();
        assert_eq!(confidences, vec![40., 90., 60.]);
        assert_eq!(result.summary(), "2x tomato, 1x carrot");
    }

    #[tokio::test]
    async fn test_unknown_class_falls_back_to_id() {
        let model = Arc::new(FixedModel::new(vec![raw(7, 0.9, [0., 0., 4., 4.])]));

        let result = service().detect(jpeg(16, 16), model).await.unwrap();

        assert_eq!(result.detections[0].label, "class_7");
    }

    #[tokio::test]
    async fn test_out_of_bounds_box_is_reported() {
        let model = Arc::new(FixedModel::new(vec![raw(0, 0.9, [10., 10., 80., 20.])]));

        let err = service().detect(jpeg(64, 48), model).await.unwrap_err();

        assert!(matches!(err, DetectionError::BoxOutOfBounds { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_decode_error() {
        let mut data = jpeg(64, 48).to_vec();
        let n = data.len();
        for byte in &mut data[4..n - 2] {
            *byte = 0;
        }
        let model = Arc::new(FixedModel::new(vec![]));

        let err = service().detect(Bytes::from(data), model).await.unwrap_err();

        assert!(matches!(err, DetectionError::Decode(_)));
    }

    #[tokio::test]
    async fn test_slow_inference_times_out() {
        let mut model = FixedModel::new(vec![]);
        model.delay = Duration::from_millis(500);
        let service = DetectionService {
            confidence_threshold: 0.3,
            inference_timeout: Duration::from_millis(50),
        };

        let err = service.detect(jpeg(16, 16), Arc::new(model)).await.unwrap_err();

        assert!(matches!(err, DetectionError::Timeout(_)));
    }

    #[test]
    fn test_rounding_is_half_to_even() {
        assert_eq!(round_half_even(2.5), 2);
        assert_eq!(round_half_even(3.5), 4);
        assert_eq!(round_half_even(-0.4), 0);
        assert_eq!(confidence_percent(1.0), 100.);
        assert_eq!(confidence_percent(0.3), 30.);
    }
}
