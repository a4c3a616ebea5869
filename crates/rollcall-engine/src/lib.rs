//! rollcall-engine: Session attendance pipeline.
//!
//! Drives frames through detection, tracking and recognition, keeps the
//! per-session identity cache and marked set, and records each identity as
//! present at most once per session.

pub mod annotate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod sqlite;
pub mod store;

pub use cache::{IdentityCache, RefreshOutcome};
pub use config::PipelineConfig;
pub use engine::{decode_frame, spawn_pipeline, EngineError, FrameError, PipelineHandle};
pub use orchestrator::{FrameOutcome, PipelineWarning, PresenceEvent, SessionOrchestrator, TrackLabel};
pub use sqlite::SqliteStore;
pub use store::{AttendanceRecord, AttendanceStore, IdentityStore, SessionSummary, StoreError};
