//! Face detection gateway.
//!
//! Backends are tried once at construction in a fixed priority order:
//! the SCRFD face model, then a general person model with a lightweight face
//! model run on each person, then a model-free skin-tone detector. Callers
//! only ever see [`DetectorGateway::detect`].

mod person;
mod scrfd;
mod skin;

pub use person::PersonFaceBackend;
pub use scrfd::{Scrfd, ScrfdBackend};
pub use skin::SkinToneBackend;

use crate::candidate::{self, BackendCandidate};
use crate::types::Detection;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// Specialized face model.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// Lightweight face model used as the secondary detector.
pub const SCRFD_LITE_MODEL_FILE: &str = "det_500m.onnx";
/// General-purpose COCO detector.
pub const YOLO_MODEL_FILE: &str = "yolov8n.onnx";

const NMS_IOU_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download it and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A concrete face detection capability.
pub trait DetectorBackend: Send {
    fn name(&self) -> &'static str;

    /// Detect faces, returning boxes in frame pixel coordinates.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Uniform detection contract over whichever backend initialized first.
pub struct DetectorGateway {
    backend: Option<Box<dyn DetectorBackend>>,
}

impl DetectorGateway {
    /// Try candidates in order; the first that constructs wins.
    pub fn select(candidates: Vec<BackendCandidate<dyn DetectorBackend>>) -> Self {
        Self {
            backend: candidate::select_first("detector", candidates),
        }
    }

    /// The standard priority chain, reading model files from `model_dir`.
    pub fn standard(model_dir: &Path) -> Self {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let yolo = model_dir.join(YOLO_MODEL_FILE);
        let scrfd_lite = model_dir.join(SCRFD_LITE_MODEL_FILE);

        Self::select(vec![
            BackendCandidate::new("scrfd", move || {
                ScrfdBackend::load(&scrfd).map(|b| Box::new(b) as Box<dyn DetectorBackend>)
            }),
            BackendCandidate::new("person+face", move || {
                PersonFaceBackend::load(&yolo, &scrfd_lite)
                    .map(|b| Box::new(b) as Box<dyn DetectorBackend>)
            }),
            BackendCandidate::new("skin-tone", || {
                Ok::<_, DetectorError>(Box::new(SkinToneBackend::default()) as Box<dyn DetectorBackend>)
            }),
        ])
    }

    pub fn with_backend(backend: Box<dyn DetectorBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A gateway with no backend; every frame yields no detections.
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// Detect faces, sorted by confidence descending.
    ///
    /// Never fails: a missing backend or a backend error yields an empty list.
    pub fn detect(&mut self, image: &RgbImage) -> Vec<Detection> {
        let Some(backend) = self.backend.as_mut() else {
            return Vec::new();
        };

        match backend.detect(image) {
            Ok(mut detections) => {
                sort_by_confidence(&mut detections);
                detections
            }
            Err(e) => {
                tracing::warn!(backend = backend.name(), error = %e, "detection failed; treating frame as empty");
                Vec::new()
            }
        }
    }
}

fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// Non-Maximum Suppression: drop detections overlapping a stronger one.
pub(crate) fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    sort_by_confidence(&mut detections);

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

pub(crate) fn nms_default(detections: Vec<Detection>) -> Vec<Detection> {
    nms(detections, NMS_IOU_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn make(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection::new(BoundingBox::from_xywh(x, y, w, h), conf)
    }

    struct Fixed(Vec<Detection>);

    impl DetectorBackend for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl DetectorBackend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                make(0.0, 0.0, 100.0, 100.0, 0.8),
                make(5.0, 5.0, 100.0, 100.0, 0.9),
                make(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_disabled_gateway_returns_empty() {
        let mut gw = DetectorGateway::disabled();
        assert!(gw.backend_name().is_none());
        assert!(gw.detect(&RgbImage::new(8, 8)).is_empty());
    }

    #[test]
    fn test_backend_error_yields_empty() {
        let mut gw = DetectorGateway::with_backend(Box::new(Failing));
        assert!(gw.detect(&RgbImage::new(8, 8)).is_empty());
    }

    #[test]
    fn test_detect_sorts_by_confidence() {
        let mut gw = DetectorGateway::with_backend(Box::new(Fixed(vec![
            make(0.0, 0.0, 10.0, 10.0, 0.5),
            make(50.0, 50.0, 10.0, 10.0, 0.9),
        ])));
        let dets = gw.detect(&RgbImage::new(8, 8));
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_sort_tolerates_nan_confidence() {
        let mut dets = vec![
            make(0.0, 0.0, 10.0, 10.0, 0.2),
            make(0.0, 0.0, 10.0, 10.0, f32::NAN),
            make(0.0, 0.0, 10.0, 10.0, 0.7),
            make(0.0, 0.0, 10.0, 10.0, 0.4),
        ];
        sort_by_confidence(&mut dets);
        let finite: Vec<f32> = dets.iter().map(|d| d.confidence).filter(|c| c.is_finite()).collect();
        assert_eq!(finite, vec![0.7, 0.4, 0.2]);
    }

    #[test]
    fn test_select_takes_first_available() {
        let gw = DetectorGateway::select(vec![
            BackendCandidate::new("missing", || {
                Err::<Box<dyn DetectorBackend>, _>(DetectorError::ModelNotFound("x.onnx".into()))
            }),
            BackendCandidate::new("fixed", || {
                Ok::<_, DetectorError>(Box::new(Fixed(vec![])) as Box<dyn DetectorBackend>)
            }),
            BackendCandidate::new("never", || -> Result<Box<dyn DetectorBackend>, DetectorError> {
                panic!("later candidates must not be constructed")
            }),
        ]);
        assert_eq!(gw.backend_name(), Some("fixed"));
    }

    #[test]
    fn test_select_none_available() {
        let mut gw = DetectorGateway::select(vec![BackendCandidate::new("missing", || {
            Err::<Box<dyn DetectorBackend>, _>(DetectorError::ModelNotFound("x.onnx".into()))
        })]);
        assert!(gw.backend_name().is_none());
        assert!(gw.detect(&RgbImage::new(8, 8)).is_empty());
    }

    #[test]
    fn test_standard_chain_falls_back_to_skin_tone() {
        let gw = DetectorGateway::standard(Path::new("/nonexistent/rollcall-models"));
        assert_eq!(gw.backend_name(), Some("skin-tone"));
    }
}
