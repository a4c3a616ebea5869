//! Face recognition gateway: embedding extraction and identity matching.

mod arcface;

pub use arcface::ArcFaceBackend;

use crate::detector::{DetectorError, SCRFD_MODEL_FILE};
use crate::candidate::{self, BackendCandidate};
use crate::types::{Embedding, IdentityRecord};
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Margin added around a tight face crop, as a fraction of its larger side.
pub const DEFAULT_CROP_PAD_RATIO: f32 = 0.3;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download it and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face localization failed: {0}")]
    Localizer(#[from] DetectorError),
    #[error("cannot average zero embeddings")]
    NoEmbeddings,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("averaged embedding has zero norm")]
    ZeroNorm,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A concrete embedding extraction capability.
pub trait EmbeddingBackend: Send {
    fn name(&self) -> &'static str;

    /// Localize a face in `image` and embed it. `Ok(None)` when no usable face is found.
    fn extract(&mut self, image: &RgbImage) -> Result<Option<Embedding>, RecognizerError>;
}

/// Best candidate accepted by [`match_identity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub identity_key: String,
    pub display_name: String,
    pub score: f32,
}

pub struct RecognizerGateway {
    backend: Option<Box<dyn EmbeddingBackend>>,
}

impl RecognizerGateway {
    pub fn select(candidates: Vec<BackendCandidate<dyn EmbeddingBackend>>) -> Self {
        Self {
            backend: candidate::select_first("recognizer", candidates),
        }
    }

    /// SCRFD + ArcFace from `model_dir`; no recognizer if either model is missing.
    pub fn standard(model_dir: &Path) -> Self {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);
        Self::select(vec![BackendCandidate::new("arcface", move || {
            ArcFaceBackend::load(&scrfd, &arcface).map(|b| Box::new(b) as Box<dyn EmbeddingBackend>)
        })])
    }

    pub fn with_backend(backend: Box<dyn EmbeddingBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// Embed the face in `image`, or `None` if there is no backend, no face,
    /// or the backend failed (logged).
    pub fn extract(&mut self, image: &RgbImage) -> Option<Embedding> {
        let backend = self.backend.as_mut()?;
        match backend.extract(image) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(backend = backend.name(), error = %e, "embedding extraction failed");
                None
            }
        }
    }

    /// Pad a tight face crop with a black border before extraction.
    pub fn extract_from_crop(&mut self, crop: &RgbImage, pad_ratio: f32) -> Option<Embedding> {
        if crop.width() == 0 || crop.height() == 0 {
            return None;
        }
        self.extract(&pad_crop(crop, pad_ratio))
    }
}

/// Surround `crop` with `round(max(w, h) * ratio)` black pixels on every side.
pub fn pad_crop(crop: &RgbImage, ratio: f32) -> RgbImage {
    let pad = (crop.width().max(crop.height()) as f32 * ratio.max(0.0)).round() as u32;
    if pad == 0 {
        return crop.clone();
    }
    let mut padded = RgbImage::new(crop.width() + 2 * pad, crop.height() + 2 * pad);
    imageops::replace(&mut padded, crop, pad as i64, pad as i64);
    padded
}

/// Flat scan for the most similar candidate.
///
/// The first candidate wins on equal scores. The best is returned only if
/// its score reaches `threshold`.
pub fn match_identity(
    query: &Embedding,
    candidates: &[IdentityRecord],
    threshold: f32,
) -> Option<IdentityMatch> {
    let mut best: Option<(&IdentityRecord, f32)> = None;

    for candidate in candidates {
        let score = query.similarity(&candidate.embedding);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }

    let (record, score) = best?;
    (score >= threshold).then(|| IdentityMatch {
        identity_key: record.identity_key.clone(),
        display_name: record.display_name.clone(),
        score,
    })
}

/// Component-wise mean of several embeddings of one person, re-normalized to unit length.
pub fn average_embeddings(embeddings: &[Embedding]) -> Result<Embedding, RecognizerError> {
    let first = embeddings.first().ok_or(RecognizerError::NoEmbeddings)?;
    let dim = first.values.len();

    let mut sum = vec![0.0f32; dim];
    for e in embeddings {
        if e.values.len() != dim {
            return Err(RecognizerError::DimensionMismatch {
                expected: dim,
                actual: e.values.len(),
            });
        }
        for (acc, v) in sum.iter_mut().zip(&e.values) {
            *acc += v;
        }
    }

    let n = embeddings.len() as f32;
    let mean = Embedding {
        values: sum.into_iter().map(|v| v / n).collect(),
        model_version: first.model_version.clone(),
    };
    if mean.norm() <= f32::EPSILON {
        return Err(RecognizerError::ZeroNorm);
    }
    Ok(mean.normalized())
}
