//! Per-session attendance pipeline.
//!
//! Each frame runs through detection, tracking and (once per track)
//! recognition. An identity produces at most one present-event per session;
//! changing the session id resets all per-session state.

use crate::annotate;
use crate::cache::IdentityCache;
use crate::config::PipelineConfig;
use crate::store::{AttendanceStore, IdentityStore};
use chrono::Utc;
use image::{imageops, RgbImage};
use rollcall_core::{
    match_identity, BoundingBox, DetectorGateway, IdentityRecord, RecognizerGateway, Track, Tracker,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    MarkedPresent,
}

/// First confirmation of an identity within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub identity_key: String,
    pub display_name: String,
    /// Match similarity, rounded to three decimals.
    pub score: f32,
    pub event: PresenceKind,
}

impl PresenceEvent {
    pub fn marked_present(identity_key: &str, display_name: &str, score: f32) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            display_name: display_name.to_string(),
            score: (score * 1000.0).round() / 1000.0,
            event: PresenceKind::MarkedPresent,
        }
    }
}

/// Label attached to one active track in the annotated frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackLabel {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub label: String,
    pub identity_key: Option<String>,
}

/// Non-fatal problems hit while processing a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// The identity store could not be read; the previous snapshot was used.
    CacheRefresh { error: String },
    /// Attendance could not be recorded; the identity stays unmarked.
    MarkPresent { identity_key: String, error: String },
}

#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub annotated: RgbImage,
    pub events: Vec<PresenceEvent>,
    pub tracks: Vec<TrackLabel>,
    pub warnings: Vec<PipelineWarning>,
}

pub struct SessionOrchestrator {
    detector: DetectorGateway,
    recognizer: RecognizerGateway,
    identities: Arc<dyn IdentityStore>,
    attendance: Arc<dyn AttendanceStore>,
    tracker: Tracker,
    cache: IdentityCache,
    marked: HashSet<String>,
    session_id: Option<String>,
    similarity_threshold: f32,
    crop_pad_ratio: f32,
}

impl SessionOrchestrator {
    pub fn new(
        detector: DetectorGateway,
        recognizer: RecognizerGateway,
        identities: Arc<dyn IdentityStore>,
        attendance: Arc<dyn AttendanceStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            detector,
            recognizer,
            identities,
            attendance,
            tracker: Tracker::new(config.tracker()),
            cache: IdentityCache::new(config.cache_ttl),
            marked: HashSet::new(),
            session_id: None,
            similarity_threshold: config.similarity_threshold,
            crop_pad_ratio: config.crop_pad_ratio,
        }
    }

    /// The session currently being processed, if any frame has been seen.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Identities marked present in the current session.
    pub fn marked(&self) -> &HashSet<String> {
        &self.marked
    }

    /// Run one frame through the pipeline.
    pub async fn process(&mut self, frame: &RgbImage, session_id: &str) -> FrameOutcome {
        if self.session_id.as_deref() != Some(session_id) {
            self.begin_session(session_id);
        }

        let mut warnings = Vec::new();
        if let Err(e) = self.cache.refresh(self.identities.as_ref(), false).await {
            tracing::warn!(error = %e, cached = self.cache.len(), "identity reload failed; using previous snapshot");
            warnings.push(PipelineWarning::CacheRefresh { error: e.to_string() });
        }
        let identities = self.cache.snapshot();

        let detections = self.detector.detect(frame);
        let tracks = self.tracker.update(&detections);

        let mut events = Vec::new();
        let mut labels = Vec::with_capacity(tracks.len());
        for track in tracks {
            let track = if !track.resolved && !identities.is_empty() {
                self.recognize(frame, track, &identities, session_id, &mut events, &mut warnings)
                    .await
            } else {
                track
            };
            labels.push(label_for(&track, &identities));
        }

        tracing::debug!(
            session_id,
            detections = detections.len(),
            tracks = labels.len(),
            events = events.len(),
            "frame processed"
        );

        let mut annotated = frame.clone();
        for label in &labels {
            annotate::draw_track(&mut annotated, &label.bbox, &label.label, label.identity_key.is_some());
        }

        FrameOutcome {
            annotated,
            events,
            tracks: labels,
            warnings,
        }
    }

    fn begin_session(&mut self, session_id: &str) {
        tracing::info!(
            previous = self.session_id.as_deref().unwrap_or("-"),
            session_id,
            "session changed; resetting tracker and attendance state"
        );
        self.tracker.reset();
        self.marked.clear();
        self.cache.invalidate();
        self.session_id = Some(session_id.to_string());
    }

    /// Attempt recognition for an unresolved track and mark the identity if new.
    async fn recognize(
        &mut self,
        frame: &RgbImage,
        track: Track,
        identities: &[IdentityRecord],
        session_id: &str,
        events: &mut Vec<PresenceEvent>,
        warnings: &mut Vec<PipelineWarning>,
    ) -> Track {
        let Some(crop) = crop_to(frame, &track.bbox) else {
            return track;
        };

        // No face in the crop yet: leave the track unresolved and retry next frame.
        let Some(query) = self.recognizer.extract_from_crop(&crop, self.crop_pad_ratio) else {
            return track;
        };

        let Some(found) = match_identity(&query, identities, self.similarity_threshold) else {
            tracing::debug!(track_id = track.track_id, "no identity match; track resolved as unknown");
            return self.tracker.resolve(track.track_id, None).unwrap_or(track);
        };

        let resolved = self
            .tracker
            .resolve(track.track_id, Some(found.identity_key.clone()))
            .unwrap_or(track);

        if self.marked.contains(&found.identity_key) {
            return resolved;
        }

        match self
            .attendance
            .mark_present(session_id, &found.identity_key, Utc::now())
            .await
        {
            Ok(()) => {
                tracing::info!(
                    session_id,
                    identity_key = %found.identity_key,
                    display_name = %found.display_name,
                    score = found.score,
                    "marked present"
                );
                self.marked.insert(found.identity_key.clone());
                events.push(PresenceEvent::marked_present(&found.identity_key, &found.display_name, found.score));
            }
            Err(e) => {
                tracing::warn!(
                    session_id,
                    identity_key = %found.identity_key,
                    error = %e,
                    "failed to record attendance"
                );
                warnings.push(PipelineWarning::MarkPresent {
                    identity_key: found.identity_key,
                    error: e.to_string(),
                });
            }
        }
        resolved
    }
}

/// The frame region under `bbox`, or `None` when it has no area inside the frame.
fn crop_to(frame: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let b = bbox.clamp_to(frame.width(), frame.height());
    let (x, y) = (b.x1.floor() as u32, b.y1.floor() as u32);
    let (x2, y2) = (b.x2.ceil() as u32, b.y2.ceil() as u32);
    if x2 <= x || y2 <= y {
        return None;
    }
    Some(imageops::crop_imm(frame, x, y, x2 - x, y2 - y).to_image())
}

fn label_for(track: &Track, identities: &[IdentityRecord]) -> TrackLabel {
    let label = match &track.identity {
        Some(key) => identities
            .iter()
            .find(|r| &r.identity_key == key)
            .map(|r| r.display_name.clone())
            .unwrap_or_else(|| format!("ID:{key}")),
        None => UNKNOWN_LABEL.to_string(),
    };
    TrackLabel {
        track_id: track.track_id,
        bbox: track.bbox,
        label,
        identity_key: track.identity.clone(),
    }
}
