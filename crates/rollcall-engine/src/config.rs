use rollcall_core::recognizer::DEFAULT_CROP_PAD_RATIO;
use rollcall_core::TrackerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Frames a track may go unmatched before it is dropped.
    pub tracker_max_age: u32,
    /// Minimum IoU for a detection to continue a track.
    pub tracker_iou_threshold: f32,
    /// How long a loaded identity snapshot stays fresh.
    pub cache_ttl: Duration,
    /// Margin added around face crops before embedding, as a fraction of the larger side.
    pub crop_pad_ratio: f32,
    /// Frames that may wait for the pipeline before producers must drop.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_dir: rollcall_core::default_model_dir(),
            db_path: data_dir.join("rollcall.db"),
            similarity_threshold: 0.45,
            tracker_max_age: 30,
            tracker_iou_threshold: 0.3,
            cache_ttl: Duration::from_secs(30),
            crop_pad_ratio: DEFAULT_CROP_PAD_RATIO,
            queue_depth: 4,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            db_path: std::env::var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            similarity_threshold: env_parse("ROLLCALL_SIMILARITY_THRESHOLD", defaults.similarity_threshold),
            tracker_max_age: env_parse("ROLLCALL_TRACKER_MAX_AGE", defaults.tracker_max_age),
            tracker_iou_threshold: env_parse("ROLLCALL_TRACKER_IOU_THRESHOLD", defaults.tracker_iou_threshold),
            cache_ttl: Duration::from_secs(env_parse("ROLLCALL_CACHE_TTL_SECS", defaults.cache_ttl.as_secs())),
            crop_pad_ratio: env_parse("ROLLCALL_CROP_PAD_RATIO", defaults.crop_pad_ratio),
            queue_depth: env_parse("ROLLCALL_QUEUE_DEPTH", defaults.queue_depth).max(1),
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            max_age: self.tracker_max_age,
            iou_threshold: self.tracker_iou_threshold,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
