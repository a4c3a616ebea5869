//! rollcall-core: Face detection, recognition and tracking.
//!
//! Detection and recognition run behind gateways that pick the first
//! available backend at startup; the tracker assigns short-lived track
//! identities so recognition runs once per tracked face rather than once
//! per frame.

pub mod alignment;
pub mod candidate;
pub mod detector;
pub mod recognizer;
pub mod tracker;
pub mod types;

pub use candidate::BackendCandidate;
pub use detector::{DetectorBackend, DetectorError, DetectorGateway};
pub use recognizer::{
    average_embeddings, match_identity, EmbeddingBackend, IdentityMatch, RecognizerError,
    RecognizerGateway,
};
pub use tracker::{Track, Tracker, TrackerConfig};
pub use types::{BoundingBox, Detection, Embedding, IdentityRecord};

use std::path::PathBuf;

/// Default directory holding the ONNX model files.
///
/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}
