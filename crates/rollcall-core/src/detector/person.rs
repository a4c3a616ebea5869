//! General-model fallback: a COCO YOLOv8 detector finds people, then the
//! lightweight SCRFD model searches the head region of each person.

use super::{nms_default, DetectorBackend, DetectorError, Scrfd};
use crate::types::{BoundingBox, Detection};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: f32 = 144.0 / 255.0;
const YOLO_BOX_CHANNELS: usize = 4;
const COCO_PERSON_CLASS: usize = 0;
const PERSON_CONFIDENCE_THRESHOLD: f32 = 0.4;
const PERSON_NMS_THRESHOLD: f32 = 0.45;
/// Fraction of a person box (from the top) searched for a face.
const HEAD_REGION_FRACTION: f32 = 0.5;

pub struct PersonFaceBackend {
    session: Session,
    faces: Scrfd,
}

impl PersonFaceBackend {
    pub fn load(yolo_path: &Path, face_path: &Path) -> Result<Self, DetectorError> {
        if !yolo_path.exists() {
            return Err(DetectorError::ModelNotFound(yolo_path.display().to_string()));
        }
        let faces = Scrfd::load(face_path)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(yolo_path)?;

        tracing::info!(path = %yolo_path.display(), "loaded YOLOv8 person model");

        Ok(Self { session, faces })
    }

    fn detect_people(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, ratio) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, preds) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("yolo output: {e}")))?;

        // [1, 4 + classes, anchors]
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let [_, channels, anchors] = dims[..] else {
            return Err(DetectorError::InferenceFailed(format!(
                "unexpected YOLO output shape {dims:?}"
            )));
        };
        if channels <= YOLO_BOX_CHANNELS + COCO_PERSON_CLASS || preds.len() < channels * anchors {
            return Err(DetectorError::InferenceFailed(format!(
                "YOLO output too small: {channels} channels × {anchors} anchors"
            )));
        }

        let (w, h) = image.dimensions();
        Ok(nms_people(decode_people(preds, anchors, ratio, w, h)))
    }
}

impl DetectorBackend for PersonFaceBackend {
    fn name(&self) -> &'static str {
        "person+face"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let people = self.detect_people(image)?;
        tracing::trace!(people = people.len(), "person+face: people found");

        let mut faces = Vec::new();
        for person in &people {
            let region = head_region(&person.bbox, image.width(), image.height());
            let (x, y) = (region.x1 as u32, region.y1 as u32);
            let (rw, rh) = (region.width() as u32, region.height() as u32);
            if rw == 0 || rh == 0 {
                continue;
            }

            let crop = imageops::crop_imm(image, x, y, rw, rh).to_image();
            for face in self.faces.detect(&crop)? {
                faces.push(Detection {
                    bbox: face.bbox.translate(x as f32, y as f32).clamp_to(image.width(), image.height()),
                    confidence: face.confidence,
                    landmarks: face
                        .landmarks
                        .map(|lms| lms.map(|(lx, ly)| (lx + x as f32, ly + y as f32))),
                });
            }
        }

        Ok(nms_default(faces))
    }
}

/// Top-left anchored resize into a 640×640 tensor scaled to [0, 1].
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let (w0, h0) = image.dimensions();
    let size = YOLO_INPUT_SIZE;
    let ratio = (size as f32 / w0.max(1) as f32).min(size as f32 / h0.max(1) as f32);
    let new_w = ((w0 as f32 * ratio).round() as u32).clamp(1, size);
    let new_h = ((h0 as f32 * ratio).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::from_elem((1, 3, size as usize, size as usize), YOLO_PAD_VALUE);
    for (x, y, Rgb([r, g, b])) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = *r as f32 / 255.0;
        tensor[[0, 1, y, x]] = *g as f32 / 255.0;
        tensor[[0, 2, y, x]] = *b as f32 / 255.0;
    }

    (tensor, ratio)
}

/// Decode channel-major `[cx, cy, w, h, class...]` predictions for the person class.
fn decode_people(preds: &[f32], anchors: usize, ratio: f32, width: u32, height: u32) -> Vec<Detection> {
    let at = |channel: usize, anchor: usize| preds[channel * anchors + anchor];

    (0..anchors)
        .filter_map(|i| {
            let score = at(YOLO_BOX_CHANNELS + COCO_PERSON_CLASS, i);
            if score < PERSON_CONFIDENCE_THRESHOLD {
                return None;
            }
            let cx = at(0, i) / ratio;
            let cy = at(1, i) / ratio;
            let w = at(2, i) / ratio;
            let h = at(3, i) / ratio;
            let bbox = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
                .clamp_to(width, height);
            Some(Detection::new(bbox, score))
        })
        .collect()
}

fn nms_people(detections: Vec<Detection>) -> Vec<Detection> {
    super::nms(detections, PERSON_NMS_THRESHOLD)
}

/// Upper part of a person box, where the head is expected.
fn head_region(person: &BoundingBox, width: u32, height: u32) -> BoundingBox {
    let region = BoundingBox::new(
        person.x1.floor(),
        person.y1.floor(),
        person.x2.ceil(),
        (person.y1 + person.height() * HEAD_REGION_FRACTION).ceil(),
    );
    region.clamp_to(width, height)
}
