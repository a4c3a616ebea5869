//! ArcFace face recognizer via ONNX Runtime.
//!
//! Localizes the face with SCRFD, aligns it to 112×112 from the five landmarks,
//! and extracts a 512-dimensional unit embedding with the w600k_r50 model.

use super::{EmbeddingBackend, RecognizerError};
use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::Scrfd;
use crate::types::{Detection, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// Different from SCRFD: ArcFace uses symmetric normalization.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

pub struct ArcFaceBackend {
    localizer: Scrfd,
    session: Session,
}

impl ArcFaceBackend {
    /// Load the SCRFD localizer and the ArcFace model.
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, RecognizerError> {
        if !arcface_path.exists() {
            return Err(RecognizerError::ModelNotFound(arcface_path.display().to_string()));
        }
        let localizer = Scrfd::load(scrfd_path)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(arcface_path)?;

        tracing::info!(
            path = %arcface_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { localizer, session })
    }

    fn embed(&mut self, aligned: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = preprocess(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let mut embedding = Embedding::new(raw.to_vec()).normalized();
        embedding.model_version = Some(ARCFACE_MODEL_VERSION.to_string());
        Ok(embedding)
    }
}

impl EmbeddingBackend for ArcFaceBackend {
    fn name(&self) -> &'static str {
        "arcface"
    }

    fn extract(&mut self, image: &RgbImage) -> Result<Option<Embedding>, RecognizerError> {
        let faces = self.localizer.detect(image)?;
        let Some(landmarks) = largest_face(&faces).and_then(|f| f.landmarks) else {
            return Ok(None);
        };

        let aligned = alignment::align_face(image, &landmarks);
        self.embed(&aligned).map(Some)
    }
}

/// The face with the largest box area; first wins on ties.
fn largest_face(faces: &[Detection]) -> Option<&Detection> {
    faces.iter().fold(None, |best: Option<&Detection>, f| match best {
        Some(b) if b.bbox.area() >= f.bbox.area() => Some(b),
        _ => Some(f),
    })
}

/// Aligned 112×112 RGB crop → NCHW float tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in aligned.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}
