//! IoU-based multi-object tracker.
//!
//! Assigns short-lived track ids to face detections so recognition runs once
//! per tracked face instead of on every frame. Matching is greedy by
//! descending IoU, which is deterministic for a fixed detection order.

use crate::types::{BoundingBox, Detection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_MAX_AGE: u32 = 30;
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Frames a track may go unmatched before it is dropped.
    pub max_age: u32,
    /// Minimum IoU for a detection to continue an existing track.
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

/// A tracker's hypothesis that successive detections belong to one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u64,
    pub bbox: BoundingBox,
    /// Consecutive frames since the last successful match.
    pub age: u32,
    /// Number of successful matches, including the one that created the track.
    pub hits: u32,
    /// Matched identity key, if recognition succeeded.
    pub identity: Option<String>,
    /// Recognition has been attempted, successfully or not.
    pub resolved: bool,
}

impl Track {
    fn spawn(track_id: u64, bbox: BoundingBox) -> Self {
        Self {
            track_id,
            bbox,
            age: 0,
            hits: 1,
            identity: None,
            resolved: false,
        }
    }

    fn matched(self, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            age: 0,
            hits: self.hits + 1,
            ..self
        }
    }

    fn aged(self) -> Self {
        Self {
            age: self.age + 1,
            ..self
        }
    }
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Feed one frame of detections; returns the active tracks in id order.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        if detections.is_empty() {
            let ids: Vec<u64> = self.tracks.keys().copied().collect();
            for id in ids {
                self.age_track(id);
            }
            return self.active();
        }

        if self.tracks.is_empty() {
            for det in detections {
                self.spawn(det.bbox);
            }
            return self.active();
        }

        let track_ids: Vec<u64> = self.tracks.keys().copied().collect();
        let pairs = self.ranked_pairs(&track_ids, detections);

        let mut track_claimed = vec![false; track_ids.len()];
        let mut det_claimed = vec![false; detections.len()];

        for (t_idx, d_idx, iou) in pairs {
            if iou < self.config.iou_threshold {
                break;
            }
            if track_claimed[t_idx] || det_claimed[d_idx] {
                continue;
            }
            track_claimed[t_idx] = true;
            det_claimed[d_idx] = true;

            let id = track_ids[t_idx];
            if let Some(track) = self.tracks.remove(&id) {
                self.tracks.insert(id, track.matched(detections[d_idx].bbox));
            }
        }

        for (det, claimed) in detections.iter().zip(&det_claimed) {
            if !claimed {
                self.spawn(det.bbox);
            }
        }

        for (id, claimed) in track_ids.iter().zip(&track_claimed) {
            if !claimed {
                self.age_track(*id);
            }
        }

        tracing::trace!(
            tracks = self.tracks.len(),
            detections = detections.len(),
            "tracker updated"
        );

        self.active()
    }

    /// Record a recognition attempt for a track.
    ///
    /// An identity already attached to the track is kept when `identity` is `None`.
    /// Returns the updated record, or `None` if the track no longer exists.
    pub fn resolve(&mut self, track_id: u64, identity: Option<String>) -> Option<Track> {
        let track = self.tracks.remove(&track_id)?;
        let updated = Track {
            identity: identity.or(track.identity.clone()),
            resolved: true,
            ..track
        };
        self.tracks.insert(track_id, updated.clone());
        Some(updated)
    }

    /// Drop a track's identity so recognition is retried on the next frame.
    pub fn clear_identity(&mut self, track_id: u64) -> Option<Track> {
        let track = self.tracks.remove(&track_id)?;
        let updated = Track {
            identity: None,
            resolved: false,
            ..track
        };
        self.tracks.insert(track_id, updated.clone());
        Some(updated)
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Clear all tracks and restart ids at 1.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }

    fn spawn(&mut self, bbox: BoundingBox) {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(id, Track::spawn(id, bbox));
    }

    fn age_track(&mut self, id: u64) {
        if let Some(track) = self.tracks.remove(&id) {
            let track = track.aged();
            if track.age > self.config.max_age {
                tracing::debug!(track_id = id, hits = track.hits, "track expired");
            } else {
                self.tracks.insert(id, track);
            }
        }
    }

    /// All (track, detection) pairs ranked by IoU descending.
    ///
    /// The sort is stable, so equal scores keep row-major order:
    /// lower track id first, then lower detection index. A non-finite IoU
    /// (from a NaN box) counts as no overlap.
    fn ranked_pairs(&self, track_ids: &[u64], detections: &[Detection]) -> Vec<(usize, usize, f32)> {
        let mut pairs = Vec::with_capacity(track_ids.len() * detections.len());
        for (t_idx, id) in track_ids.iter().enumerate() {
            let Some(track) = self.tracks.get(id) else {
                continue;
            };
            for (d_idx, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                pairs.push((t_idx, d_idx, if iou.is_finite() { iou } else { 0.0 }));
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));
        pairs
    }

    fn active(&self) -> Vec<Track> {
        self.tracks.values().cloned().collect()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), 0.9)
    }

    fn tracker(max_age: u32) -> Tracker {
        Tracker::new(TrackerConfig {
            max_age,
            iou_threshold: 0.3,
        })
    }

    #[test]
    fn test_first_frame_creates_tracks() {
        let mut t = tracker(5);
        let tracks = t.update(&[det(0.0, 0.0, 10.0, 10.0), det(50.0, 50.0, 60.0, 60.0)]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].track_id, 1);
        assert_eq!(tracks[1].track_id, 2);
        assert!(tracks.iter().all(|t| t.age == 0 && t.hits == 1 && !t.resolved));
    }

    #[test]
    fn test_id_persists_under_small_motion() {
        let mut t = tracker(5);
        let first = t.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        let id = first[0].track_id;

        for step in 1..20 {
            let dx = step as f32 * 3.0;
            let tracks = t.update(&[det(100.0 + dx, 100.0, 200.0 + dx, 200.0)]);
            assert_eq!(tracks.len(), 1);
            assert_eq!(tracks[0].track_id, id);
            assert_eq!(tracks[0].hits, step + 1);
            assert_eq!(tracks[0].age, 0);
        }
    }

    #[test]
    fn test_low_iou_spawns_fresh_id() {
        let mut t = tracker(5);
        t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        let tracks = t.update(&[det(100.0, 100.0, 110.0, 110.0)]);

        assert_eq!(tracks.len(), 2);
        let old = tracks.iter().find(|t| t.track_id == 1).unwrap();
        let new = tracks.iter().find(|t| t.track_id == 2).unwrap();
        assert_eq!(old.age, 1);
        assert_eq!(new.age, 0);
        assert_eq!(new.hits, 1);
    }

    #[test]
    fn test_track_expires_after_max_age() {
        let mut t = tracker(2);
        t.update(&[det(0.0, 0.0, 10.0, 10.0)]);

        assert_eq!(t.update(&[]).len(), 1); // age 1
        assert_eq!(t.update(&[]).len(), 1); // age 2
        assert!(t.update(&[]).is_empty()); // age 3 > max_age
    }

    #[test]
    fn test_unmatched_track_ages_while_others_match() {
        let mut t = tracker(1);
        t.update(&[det(0.0, 0.0, 10.0, 10.0), det(50.0, 50.0, 60.0, 60.0)]);

        let tracks = t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(t.get(2).unwrap().age, 1);

        let tracks = t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, 1);
    }

    #[test]
    fn test_greedy_prefers_highest_iou() {
        let mut t = tracker(5);
        t.update(&[det(0.0, 0.0, 100.0, 100.0)]);

        // Second detection overlaps more; it should take the track.
        let tracks = t.update(&[det(40.0, 0.0, 140.0, 100.0), det(5.0, 0.0, 105.0, 100.0)]);
        let kept = tracks.iter().find(|t| t.track_id == 1).unwrap();
        assert_eq!(kept.bbox, BoundingBox::new(5.0, 0.0, 105.0, 100.0));
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn test_equal_iou_tie_goes_to_first_track() {
        let mut t = tracker(5);
        // Two identical tracks; one detection matching both equally.
        t.update(&[det(0.0, 0.0, 10.0, 10.0), det(0.0, 0.0, 10.0, 10.0)]);
        let tracks = t.update(&[det(0.0, 0.0, 10.0, 10.0)]);

        assert_eq!(t.get(1).unwrap().hits, 2);
        assert_eq!(t.get(2).unwrap().age, 1);
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn test_resolve_keeps_identity() {
        let mut t = tracker(5);
        t.update(&[det(0.0, 0.0, 10.0, 10.0)]);

        let r = t.resolve(1, Some("S1".into())).unwrap();
        assert!(r.resolved);
        assert_eq!(r.identity.as_deref(), Some("S1"));

        let r = t.resolve(1, None).unwrap();
        assert_eq!(r.identity.as_deref(), Some("S1"));

        // Identity survives subsequent matches.
        let tracks = t.update(&[det(1.0, 0.0, 11.0, 10.0)]);
        assert_eq!(tracks[0].identity.as_deref(), Some("S1"));
        assert!(tracks[0].resolved);

        assert!(t.resolve(99, None).is_none());
    }

    #[test]
    fn test_clear_identity() {
        let mut t = tracker(5);
        t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        t.resolve(1, Some("S1".into()));

        let r = t.clear_identity(1).unwrap();
        assert!(r.identity.is_none());
        assert!(!r.resolved);
    }

    #[test]
    fn test_reset_restarts_ids() {
        let mut t = tracker(5);
        t.update(&[det(0.0, 0.0, 10.0, 10.0), det(50.0, 50.0, 60.0, 60.0)]);
        t.reset();
        assert!(t.is_empty());

        let tracks = t.update(&[det(200.0, 200.0, 210.0, 210.0)]);
        assert_eq!(tracks[0].track_id, 1);
    }

    #[test]
    fn test_ids_never_reused_without_reset() {
        let mut t = tracker(0);
        t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        t.update(&[]); // track 1 expires
        let tracks = t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(tracks[0].track_id, 2);
    }

    #[test]
    fn test_nan_box_never_continues_a_track() {
        let mut t = tracker(5);
        t.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        let tracks = t.update(&[det(f32::NAN, 0.0, 10.0, 10.0)]);

        assert_eq!(tracks.len(), 2);
        assert_eq!(t.get(1).unwrap().age, 1);
        assert_eq!(t.get(2).unwrap().hits, 1);
    }
}
