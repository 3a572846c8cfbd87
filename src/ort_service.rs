use crate::{
    config::ModelConfig,
    model_service::{ClassNames, InferenceError, LoadError, ModelLoader, ModelService, RawDetection},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayView2, Axis, Ix2, Ix4};
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    fs::File,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// Metadata key under which Ultralytics exports store the class map.
const NAMES_METADATA_KEY: &str = "names";

const LETTERBOX_FILL: f32 = 114. / 255.;

fn intersection(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &RawDetection, box2: &RawDetection) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Placement of the resized image on the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    width: u32,
    height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn new(img_width: u32, img_height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / img_width.max(1) as f32)
            .min(input_size as f32 / img_height.max(1) as f32);
        let width = ((img_width as f32 * scale).round() as u32).clamp(1, input_size);
        let height = ((img_height as f32 * scale).round() as u32).clamp(1, input_size);

        Self {
            scale,
            width,
            height,
            pad_x: (input_size - width) / 2,
            pad_y: (input_size - height) / 2,
        }
    }
}

/// Resizes keeping the aspect ratio and centers the result on a gray (114)
/// canvas, as the detector was trained.
fn transform_image(image: &DynamicImage, input_size: u32) -> (Array<f32, Ix4>, Letterbox) {
    let size = input_size as usize;
    let (img_width, img_height) = image.dimensions();
    let letterbox = Letterbox::new(img_width, img_height, input_size);
    let img = image
        .resize_exact(letterbox.width, letterbox.height, FilterType::Triangle)
        .to_rgb8();

    let mut input = Array::from_elem((1, 3, size, size), LETTERBOX_FILL);
    let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize + pad_x;
        let y = y as usize + pad_y;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    (input, letterbox)
}

/// Turns a `[4 + num_classes, num_anchors]` prediction matrix into boxes in
/// original image coordinates, clipped to the image. Scores must be strictly
/// above `min_confidence`.
fn decode_predictions(
    predictions: ArrayView2<f32>,
    min_confidence: f32,
    letterbox: &Letterbox,
    img_width: u32,
    img_height: u32,
) -> Vec<RawDetection> {
    let pad_x = letterbox.pad_x as f32;
    let pad_y = letterbox.pad_y as f32;
    let max_x = img_width as f32;
    let max_y = img_height as f32;

    let mut boxes = Vec::new();
    for column in predictions.axis_iter(Axis(1)) {
        let best = column
            .slice(s![4..])
            .iter()
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, prob)) = best else {
            continue;
        };

        if prob <= min_confidence {
            continue;
        }

        let xc = (column[0] - pad_x) / letterbox.scale;
        let yc = (column[1] - pad_y) / letterbox.scale;
        let w = column[2] / letterbox.scale;
        let h = column[3] / letterbox.scale;

        boxes.push(RawDetection {
            class_id: class_id as u32,
            confidence: prob,
            x1: (xc - w / 2.).clamp(0., max_x),
            y1: (yc - h / 2.).clamp(0., max_y),
            x2: (xc + w / 2.).clamp(0., max_x),
            y2: (yc + h / 2.).clamp(0., max_y),
        });
    }

    boxes
}

/// Greedy per-class NMS. The result is ordered by descending confidence.
fn non_max_suppression(
    mut boxes: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut result: Vec<RawDetection> = Vec::new();
    for candidate in boxes {
        if result.len() >= max_detections {
            break;
        }
        let suppressed = result.iter().any(|kept| {
            kept.class_id == candidate.class_id && iou(kept, &candidate) > iou_threshold
        });
        if !suppressed {
            result.push(candidate);
        }
    }

    result
}

/// Parses the Ultralytics `names` metadata, a Python dict literal such as
/// `{0: 'person', 1: "traffic light"}`.
pub fn parse_names_metadata(raw: &str) -> Result<ClassNames, String> {
    let body = raw
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("names metadata is not a dict: {}", raw))?;

    let mut names = ClassNames::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once(':')
            .ok_or_else(|| format!("missing ':' in names metadata near '{}'", rest))?;
        let class_id: u32 = key
            .trim()
            .parse()
            .map_err(|_| format!("invalid class id '{}'", key.trim()))?;

        let after_key = after_key.trim_start();
        let quote = after_key
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| format!("class {} has an unquoted name", class_id))?;
        let value = &after_key[1..];
        let end = value
            .find(quote)
            .ok_or_else(|| format!("unterminated name for class {}", class_id))?;
        names.insert(class_id, value[..end].to_string());

        rest = value[end + 1..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }

    Ok(names)
}

/// Reads one label per line. Lines may carry trailing `,r,g,b` colour columns.
pub fn load_labels(filepath: &Path) -> io::Result<ClassNames> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut names = ClassNames::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            continue;
        }
        names.insert(names.len() as u32, label.to_string());
    }

    if names.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no labels found in {}", filepath.display()),
        ));
    }

    Ok(names)
}

#[derive(Debug, Clone)]
pub struct OrtModelLoader {
    num_instances: usize,
    input_size: u32,
    iou_threshold: f32,
    max_detections: usize,
    intra_threads: Option<usize>,
    labels_file: Option<PathBuf>,
}

impl OrtModelLoader {
    pub fn new(model_config: &ModelConfig) -> Self {
        Self {
            num_instances: model_config.num_instances.max(1),
            input_size: model_config.input_size,
            iou_threshold: model_config.iou_threshold,
            max_detections: model_config.max_detections,
            intra_threads: model_config.intra_threads,
            labels_file: model_config.labels_file.clone(),
        }
    }

    fn build_session(&self, path: &Path) -> Result<Session, ort::Error> {
        let mut builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if let Some(threads) = self.intra_threads {
            builder = builder.with_intra_threads(threads)?;
        }
        #[cfg(feature = "tensorrt")]
        {
            builder = builder.with_execution_providers([TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build()])?;
        }
        builder.commit_from_file(path)
    }

    fn class_names(&self, session: &Session) -> Result<ClassNames, String> {
        if let Some(labels_file) = &self.labels_file {
            return load_labels(labels_file)
                .map_err(|e| format!("failed to load labels {}: {}", labels_file.display(), e));
        }

        let metadata = session
            .metadata()
            .map_err(|e| format!("failed to read model metadata: {}", e))?;
        match metadata
            .custom(NAMES_METADATA_KEY)
            .map_err(|e| format!("failed to read class names: {}", e))?
        {
            Some(raw) => parse_names_metadata(&raw),
            None => {
                tracing::warn!("Model carries no class names, labels will fall back to class ids");
                Ok(ClassNames::new())
            }
        }
    }
}

impl ModelLoader for OrtModelLoader {
    type Model = OrtModel;

    fn load(&self, path: &Path) -> Result<OrtModel, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound {
                path: path.display().to_string(),
            });
        }

        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        tracing::info!(
            "Found model file: {} ({:.1} MB)",
            path.display(),
            file_size as f64 / 1024. / 1024.
        );
        if file_size < 1024 * 1024 {
            tracing::warn!(
                "Model file seems small ({} bytes), it might be corrupted",
                file_size
            );
        }

        let sessions = (0..self.num_instances)
            .map(|_| self.build_session(path))
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| LoadError::corrupt(path, e))?;

        let output_name = sessions[0]
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| LoadError::corrupt(path, "model has no outputs"))?;
        let class_names = self
            .class_names(&sessions[0])
            .map_err(|e| LoadError::corrupt(path, e))?;

        tracing::info!(
            "Created {} ONNX sessions, output '{}', {} classes",
            sessions.len(),
            output_name,
            class_names.len()
        );

        Ok(OrtModel {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            counter: AtomicUsize::new(0),
            output_name,
            class_names,
            input_size: self.input_size,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
        })
    }
}

pub struct OrtModel {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    output_name: String,
    class_names: ClassNames,
    input_size: u32,
    iou_threshold: f32,
    max_detections: usize,
}

impl OrtModel {
    fn run_inference(
        &self,
        input: &Array<f32, Ix4>,
    ) -> Result<ndarray::ArrayD<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| InferenceError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferenceError::Input(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Run(e.to_string()))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Output(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| InferenceError::Output(format!("invalid tensor shape: {}", e)))
    }
}

impl ModelService for OrtModel {
    fn class_names(&self) -> &ClassNames {
        &self.class_names
    }

    fn predict(
        &self,
        image: &DynamicImage,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let (img_width, img_height) = image.dimensions();
        let (input, letterbox) = transform_image(image, self.input_size);
        let output = self.run_inference(&input)?;

        if output.ndim() != 3 || output.shape()[0] != 1 {
            return Err(InferenceError::Output(format!(
                "expected a [1, features, anchors] tensor, got {:?}",
                output.shape()
            )));
        }
        let predictions = output
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| InferenceError::Output(e.to_string()))?;
        // Some exports emit [anchors, features] instead.
        let predictions = if predictions.shape()[0] > predictions.shape()[1] {
            predictions.reversed_axes()
        } else {
            predictions
        };
        if predictions.shape()[0] < 5 {
            return Err(InferenceError::Output(format!(
                "expected at least 5 features per anchor, got {}",
                predictions.shape()[0]
            )));
        }

        let boxes = decode_predictions(
            predictions,
            min_confidence,
            &letterbox,
            img_width,
            img_height,
        );
        Ok(non_max_suppression(
            boxes,
            self.iou_threshold,
            self.max_detections,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array2;
    use std::io::Write;

    fn raw(class_id: u32, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn test_letterbox_keeps_aspect_ratio() {
        assert_eq!(
            Letterbox::new(640, 480, 640),
            Letterbox {
                scale: 1.,
                width: 640,
                height: 480,
                pad_x: 0,
                pad_y: 80,
            }
        );
        assert_eq!(
            Letterbox::new(160, 320, 640),
            Letterbox {
                scale: 2.,
                width: 320,
                height: 640,
                pad_x: 160,
                pad_y: 0,
            }
        );
    }

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        let (input, letterbox) = transform_image(&DynamicImage::ImageRgb8(img), 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!((letterbox.width, letterbox.height), (640, 320));
        assert_eq!(letterbox.pad_y, 160);
        // Padding band above the image.
        assert!((input[[0, 0, 10, 10]] - LETTERBOX_FILL).abs() < 1e-6);
        assert!((input[[0, 1, 10, 10]] - LETTERBOX_FILL).abs() < 1e-6);
        // Image content.
        assert!((input[[0, 0, 320, 10]] - 1.0).abs() < 1e-3);
        assert!(input[[0, 1, 320, 10]].abs() < 1e-3);
        // Padding band below the image.
        assert!((input[[0, 2, 630, 10]] - LETTERBOX_FILL).abs() < 1e-6);
    }

    #[test]
    fn test_decode_predictions_undoes_letterbox() {
        // Two anchors, two classes: rows are xc, yc, w, h, score0, score1.
        let predictions = Array2::from_shape_vec(
            (6, 2),
            vec![
                320., 100., //
                320., 100., //
                64., 20., //
                128., 20., //
                0.9, 0.1, //
                0.05, 0.2, //
            ],
        )
        .unwrap();
        // 1280x320 lands as 640x160 with 240 rows of padding above.
        let letterbox = Letterbox::new(1280, 320, 640);

        let boxes = decode_predictions(predictions.view(), 0.3, &letterbox, 1280, 320);

        assert_eq!(boxes.len(), 1);
        let detection = boxes[0];
        assert_eq!(detection.class_id, 0);
        assert_eq!(detection.x1, 576.);
        assert_eq!(detection.x2, 704.);
        assert_eq!(detection.y1, 32.);
        assert_eq!(detection.y2, 288.);
    }

    #[test]
    fn test_decode_predictions_camera_frame() {
        // A 4:3 frame keeps its scale; only the vertical padding is removed.
        let predictions =
            Array2::from_shape_vec((5, 1), vec![320., 320., 100., 100., 0.7]).unwrap();
        let letterbox = Letterbox::new(640, 480, 640);

        let boxes = decode_predictions(predictions.view(), 0.3, &letterbox, 640, 480);

        assert_eq!(
            (boxes[0].x1, boxes[0].y1, boxes[0].x2, boxes[0].y2),
            (270., 190., 370., 290.)
        );
    }

    #[test]
    fn test_decode_predictions_drops_scores_at_threshold() {
        let predictions = Array2::from_shape_vec(
            (5, 2),
            vec![
                100., 200., //
                100., 200., //
                10., 10., //
                10., 10., //
                0.3, 0.31, //
            ],
        )
        .unwrap();
        let letterbox = Letterbox::new(640, 640, 640);

        let boxes = decode_predictions(predictions.view(), 0.3, &letterbox, 640, 640);

        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].confidence, 0.31);
    }

    #[test]
    fn test_decode_predictions_clips_to_image() {
        let predictions =
            Array2::from_shape_vec((5, 1), vec![5., 635., 40., 40., 0.8]).unwrap();
        let letterbox = Letterbox::new(640, 640, 640);

        let boxes = decode_predictions(predictions.view(), 0.3, &letterbox, 640, 640);

        assert_eq!(boxes[0].x1, 0.);
        assert_eq!(boxes[0].y2, 640.);
    }

    #[test]
    fn test_nms_is_per_class() {
        let boxes = vec![
            raw(0, 0.6, 10., 10., 50., 50.),
            raw(0, 0.9, 12., 12., 52., 52.),
            raw(1, 0.7, 12., 12., 52., 52.),
            raw(0, 0.5, 200., 200., 240., 240.),
        ];

        let kept = non_max_suppression(boxes, 0.7, 300);

        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
        assert_eq!(kept[2].x1, 200.);
    }

    #[test]
    fn test_nms_caps_detections() {
        let boxes = (0..10)
            .map(|i| raw(0, 0.5, i as f32 * 100., 0., i as f32 * 100. + 10., 10.))
            .collect();

        assert_eq!(non_max_suppression(boxes, 0.7, 4).len(), 4);
    }

    #[test]
    fn test_iou_of_disjoint_boxes_is_zero() {
        let a = raw(0, 1., 0., 0., 10., 10.);
        let b = raw(0, 1., 20., 20., 30., 30.);
        assert_eq!(iou(&a, &b), 0.);
    }

    #[test]
    fn test_parse_names_metadata() {
        let names = parse_names_metadata("{0: 'tomato', 1: \"bell pepper, red\"}").unwrap();
        assert_eq!(names.get(&0).map(String::as_str), Some("tomato"));
        assert_eq!(names.get(&1).map(String::as_str), Some("bell pepper, red"));

        assert!(parse_names_metadata("{}").unwrap().is_empty());
        assert!(parse_names_metadata("[0, 1]").is_err());
        assert!(parse_names_metadata("{x: 'a'}").is_err());
    }

    #[test]
    fn test_load_labels_accepts_colour_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "carrot, 255, 128, 0").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "lettuce").unwrap();

        let names = load_labels(file.path()).unwrap();

        assert_eq!(names.len(), 2);
        assert_eq!(names[&0], "carrot");
        assert_eq!(names[&1], "lettuce");
    }

    #[test]
    fn test_missing_model_is_not_found() {
        let loader = OrtModelLoader {
            num_instances: 1,
            input_size: 640,
            iou_threshold: 0.7,
            max_detections: 300,
            intra_threads: None,
            labels_file: None,
        };

        let err = loader
            .load(Path::new("definitely/not/here.onnx"))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::NotFound { .. }));
    }
}
