// src/analysis/hazard_tracker.rs
//
// Cross-frame hazard tracker. Owns every live track; nothing else mutates
// track state, and only snapshots leave this module.
//
// Design:
//   - Greedy nearest-neighbour association in 3D (or normalized screen
//     space for degraded hazards), same class and positioning mode only
//   - TENTATIVE → ESTABLISHED after enough samples inside the temporal window
//   - Silent tracks go LOST and are never re-associated; a fresh detection
//     of the same hazard starts a new track
//   - Multiplicative decay on tracks left unmatched and on LOST tracks,
//     removal below a confidence floor or past a hard age ceiling
//   - Late (background) results merge additively by their own timestamp

use super::ego_motion::EgoMotionDelta;
use crate::analysis::confidence_scorer::TemporalWindow;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    BoundingBox, Extent3, FactorBreakdown, HazardClass, Position3, Positioning, Severity,
    SpatialHazard,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Max 3D distance (m) between a track and a detection to associate
    pub association_distance_m: f64,
    /// Association gate for screen-space tracks (normalized image units)
    pub screen_association_distance: f64,
    /// Silent age after which a track is LOST
    pub max_tracking_age_ms: f64,
    /// Silent age after which a track is removed regardless of confidence
    pub hard_max_age_ms: f64,
    /// Samples inside the temporal window needed to become ESTABLISHED
    pub min_detections_to_establish: u32,
    pub temporal_window_ms: f64,
    /// Per-step multiplicative decay for unmatched and LOST tracks
    pub confidence_decay: f32,
    /// Tracks whose decayed confidence falls below this are removed
    pub removal_confidence_floor: f32,
    /// History samples kept per track
    pub history_capacity: usize,
    /// Weight of a new measurement in the smoothed position (1.0 = replace)
    pub position_smoothing: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            association_distance_m: 2.0,
            screen_association_distance: 0.1,
            max_tracking_age_ms: 10_000.0,
            hard_max_age_ms: 30_000.0,
            min_detections_to_establish: 3,
            temporal_window_ms: 5_000.0,
            confidence_decay: 0.95,
            removal_confidence_floor: 0.1,
            history_capacity: 32,
            position_smoothing: 0.5,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        let positive = [
            ("tracker.association_distance_m", self.association_distance_m),
            ("tracker.screen_association_distance", self.screen_association_distance),
            ("tracker.max_tracking_age_ms", self.max_tracking_age_ms),
            ("tracker.hard_max_age_ms", self.hard_max_age_ms),
            ("tracker.temporal_window_ms", self.temporal_window_ms),
        ];
        for (field, v) in positive {
            if !v.is_finite() || v <= 0.0 {
                return Err(PipelineError::invalid_config(
                    field,
                    format!("must be positive and finite, got {}", v),
                ));
            }
        }
        if self.hard_max_age_ms < self.max_tracking_age_ms {
            return Err(PipelineError::invalid_config(
                "tracker.hard_max_age_ms",
                "must be >= max_tracking_age_ms",
            ));
        }
        if self.min_detections_to_establish == 0 {
            return Err(PipelineError::invalid_config(
                "tracker.min_detections_to_establish",
                "must be at least 1",
            ));
        }
        if !self.confidence_decay.is_finite()
            || self.confidence_decay <= 0.0
            || self.confidence_decay > 1.0
        {
            return Err(PipelineError::invalid_config(
                "tracker.confidence_decay",
                format!("must be within (0, 1], got {}", self.confidence_decay),
            ));
        }
        if !self.removal_confidence_floor.is_finite()
            || !(0.0..1.0).contains(&self.removal_confidence_floor)
        {
            return Err(PipelineError::invalid_config(
                "tracker.removal_confidence_floor",
                format!("must be within [0, 1), got {}", self.removal_confidence_floor),
            ));
        }
        if self.history_capacity < self.min_detections_to_establish as usize {
            return Err(PipelineError::invalid_config(
                "tracker.history_capacity",
                "must hold at least min_detections_to_establish samples",
            ));
        }
        if !self.position_smoothing.is_finite()
            || self.position_smoothing <= 0.0
            || self.position_smoothing > 1.0
        {
            return Err(PipelineError::invalid_config(
                "tracker.position_smoothing",
                format!("must be within (0, 1], got {}", self.position_smoothing),
            ));
        }
        Ok(())
    }

    pub fn temporal_window(&self) -> TemporalWindow {
        TemporalWindow {
            window_ms: self.temporal_window_ms,
            min_detections: self.min_detections_to_establish,
        }
    }

    fn gate(&self, positioning: Positioning) -> f64 {
        match positioning {
            Positioning::Spatial => self.association_distance_m,
            Positioning::ScreenSpace => self.screen_association_distance,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    Tentative,
    Established,
    Lost,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tentative => "TENTATIVE",
            Self::Established => "ESTABLISHED",
            Self::Lost => "LOST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HistorySample {
    timestamp_ms: f64,
    position: Position3,
    confidence: f32,
}

/// Read-only history of the track a detection would most likely join.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalEvidence {
    pub track_id: u64,
    pub state: TrackState,
    pub sample_times_ms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub id: u64,
    pub class: HazardClass,
    pub state: TrackState,
    pub positioning: Positioning,
    pub position: Position3,
    pub confidence: f32,
    pub detection_count: u32,
    /// Consecutive detector updates without a match
    pub missed: u32,
    pub last_update_ms: f64,
    pub silent_age_ms: f64,
}

/// Immutable view of all tracks after a complete update step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub tracks: Vec<TrackSnapshot>,
}

impl TrackerSnapshot {
    pub fn get(&self, id: u64) -> Option<&TrackSnapshot> {
        self.tracks.iter().find(|t| t.id == id)
    }
}

/// What one tracker step did, for logging and metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    pub matched: usize,
    pub created: Vec<u64>,
    pub promoted: Vec<u64>,
    pub lost: Vec<u64>,
    pub removed: Vec<u64>,
}

/// A single tracked hazard.
#[derive(Debug, Clone)]
struct Track {
    id: u64,
    class: HazardClass,
    positioning: Positioning,
    state: TrackState,
    position: Position3,
    extent: Extent3,
    source_bbox: BoundingBox,
    depth_m: f64,
    uncertainty_m: f64,
    /// Overall confidence at the last match, before decay
    scored_confidence: f32,
    /// Factors at the last match; `decay` accumulates while unmatched
    factors: FactorBreakdown,
    merged_detections: u32,
    severity: Option<Severity>,
    history: VecDeque<HistorySample>,
    detection_count: u32,
    last_update_ms: f64,
    missed: u32,
}

impl Track {
    fn new(id: u64, hazard: &SpatialHazard, timestamp_ms: f64, capacity: usize) -> Self {
        let mut history = VecDeque::with_capacity(capacity);
        history.push_back(HistorySample {
            timestamp_ms,
            position: hazard.position,
            confidence: hazard.confidence,
        });
        Self {
            id,
            class: hazard.class.clone(),
            positioning: hazard.positioning,
            state: TrackState::Tentative,
            position: hazard.position,
            extent: hazard.extent,
            source_bbox: hazard.source_bbox,
            depth_m: hazard.depth_m,
            uncertainty_m: hazard.uncertainty_m,
            scored_confidence: hazard.confidence,
            factors: hazard.factors.clone(),
            merged_detections: hazard.merged_detections,
            severity: hazard.severity,
            history,
            detection_count: 1,
            last_update_ms: timestamp_ms,
            missed: 0,
        }
    }

    fn confidence(&self) -> f32 {
        self.scored_confidence * self.factors.decay
    }

    fn silent_age_ms(&self, now_ms: f64) -> f64 {
        (now_ms - self.last_update_ms).max(0.0)
    }

    fn samples_within(&self, window_ms: f64, now_ms: f64) -> usize {
        self.history
            .iter()
            .filter(|s| now_ms - s.timestamp_ms <= window_ms)
            .count()
    }

    /// Insert keeping the history sorted by time and bounded.
    fn push_sample(&mut self, sample: HistorySample, capacity: usize) {
        let at = self
            .history
            .iter()
            .rposition(|s| s.timestamp_ms <= sample.timestamp_ms)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.history.insert(at, sample);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    /// Take over the measurement from a newer detection.
    fn absorb(&mut self, hazard: &SpatialHazard, timestamp_ms: f64, smoothing: f64) {
        self.position += (hazard.position - self.position) * smoothing;
        self.depth_m = match self.positioning {
            Positioning::Spatial => self.position.z,
            Positioning::ScreenSpace => 0.0,
        };
        self.extent = hazard.extent;
        self.source_bbox = hazard.source_bbox;
        self.uncertainty_m = hazard.uncertainty_m;
        self.scored_confidence = hazard.confidence;
        self.factors = hazard.factors.clone();
        self.merged_detections = hazard.merged_detections;
        if hazard.severity.is_some() {
            self.severity = hazard.severity;
        }
        self.last_update_ms = timestamp_ms;
        self.missed = 0;
    }

    /// Promote if enough samples fall inside the window. Returns true on promotion.
    fn check_established(&mut self, config: &TrackerConfig, now_ms: f64) -> bool {
        if self.state == TrackState::Tentative
            && self.samples_within(config.temporal_window_ms, now_ms)
                >= config.min_detections_to_establish as usize
        {
            self.state = TrackState::Established;
            return true;
        }
        false
    }

    fn decay(&mut self, rate: f32) {
        self.factors.decay *= rate;
    }

    fn to_hazard(&self, timestamp_ms: f64) -> SpatialHazard {
        SpatialHazard {
            id: Uuid::new_v4(),
            tracking_id: Some(self.id),
            class: self.class.clone(),
            position: self.position,
            extent: self.extent,
            source_bbox: self.source_bbox,
            positioning: self.positioning,
            depth_m: self.depth_m,
            uncertainty_m: self.uncertainty_m,
            confidence: self.confidence(),
            factors: self.factors.clone(),
            merged_detections: self.merged_detections,
            severity: self.severity,
            timestamp_ms,
        }
    }

    fn snapshot(&self, now_ms: f64) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            class: self.class.clone(),
            state: self.state,
            positioning: self.positioning,
            position: self.position,
            confidence: self.confidence(),
            detection_count: self.detection_count,
            missed: self.missed,
            last_update_ms: self.last_update_ms,
            silent_age_ms: self.silent_age_ms(now_ms),
        }
    }
}

// ============================================================================
// MAIN TRACKER
// ============================================================================

pub struct HazardTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl HazardTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Greedy nearest-neighbour pairs between live tracks and hazards.
    ///
    /// Ordering: ascending distance, then higher detection confidence, then
    /// higher track confidence, then lower track id.
    fn associate(&self, hazards: &[SpatialHazard]) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            if track.state == TrackState::Lost {
                continue;
            }
            let gate = self.config.gate(track.positioning);
            for (di, hazard) in hazards.iter().enumerate() {
                if hazard.class != track.class || hazard.positioning != track.positioning {
                    continue;
                }
                let dist = (hazard.position - track.position).norm();
                if dist <= gate {
                    pairs.push((ti, di, dist));
                }
            }
        }

        pairs.sort_by(|a, b| {
            a.2.partial_cmp(&b.2)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    hazards[b.1]
                        .confidence
                        .partial_cmp(&hazards[a.1].confidence)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| {
                    self.tracks[b.0]
                        .confidence()
                        .partial_cmp(&self.tracks[a.0].confidence())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| self.tracks[a.0].id.cmp(&self.tracks[b.0].id))
        });

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; hazards.len()];
        let mut assignments = Vec::new();
        for (ti, di, _dist) in pairs {
            if matched_tracks[ti] || matched_dets[di] {
                continue;
            }
            matched_tracks[ti] = true;
            matched_dets[di] = true;
            assignments.push((ti, di));
        }
        assignments
    }

    fn spawn(&mut self, hazard: &mut SpatialHazard, timestamp_ms: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let track = Track::new(id, hazard, timestamp_ms, self.config.history_capacity);
        info!(
            "🆕 New track H{} created: class={}, pos=({:.2}, {:.2}, {:.2}), conf={:.2}",
            id,
            track.class,
            track.position.x,
            track.position.y,
            track.position.z,
            track.confidence()
        );
        hazard.tracking_id = Some(id);
        self.tracks.push(track);
        id
    }

    /// Full association step for one frame of scored hazards. Assigns
    /// `tracking_id` on every hazard.
    pub fn update(&mut self, hazards: &mut [SpatialHazard], timestamp_ms: f64) -> TrackerUpdate {
        let mut report = TrackerUpdate::default();
        let assignments = self.associate(hazards);

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; hazards.len()];

        for (ti, di) in assignments {
            matched_tracks[ti] = true;
            matched_dets[di] = true;

            let capacity = self.config.history_capacity;
            let smoothing = self.config.position_smoothing;
            let track = &mut self.tracks[ti];
            let hazard = &mut hazards[di];

            track.push_sample(
                HistorySample {
                    timestamp_ms,
                    position: hazard.position,
                    confidence: hazard.confidence,
                },
                capacity,
            );
            track.detection_count += 1;
            track.absorb(hazard, timestamp_ms, smoothing);
            hazard.tracking_id = Some(track.id);
            report.matched += 1;

            if track.check_established(&self.config, timestamp_ms) {
                info!(
                    "✅ Track H{} ESTABLISHED ({} detections, class={})",
                    track.id, track.detection_count, track.class
                );
                report.promoted.push(track.id);
            }
        }

        // Unmatched tracks (LOST ones included) miss and decay once.
        let rate = self.config.confidence_decay;
        for (ti, matched) in matched_tracks.iter().enumerate() {
            if !matched {
                let track = &mut self.tracks[ti];
                track.missed += 1;
                track.decay(rate);
            }
        }

        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let id = self.spawn(&mut hazards[di], timestamp_ms);
                report.created.push(id);
            }
        }

        self.age_tracks(timestamp_ms, &mut report);
        self.prune(timestamp_ms, &mut report);
        report
    }

    /// Tracker-only step: LOST decay, LOST transitions, pruning. Tracks that
    /// are still live keep their confidence.
    pub fn propagate(&mut self, timestamp_ms: f64) -> TrackerUpdate {
        let mut report = TrackerUpdate::default();
        let rate = self.config.confidence_decay;
        for track in self.tracks.iter_mut().filter(|t| t.state == TrackState::Lost) {
            track.decay(rate);
        }
        self.age_tracks(timestamp_ms, &mut report);
        self.prune(timestamp_ms, &mut report);
        report
    }

    fn age_tracks(&mut self, now_ms: f64, report: &mut TrackerUpdate) {
        let max_age = self.config.max_tracking_age_ms;
        for track in &mut self.tracks {
            if track.state != TrackState::Lost && track.silent_age_ms(now_ms) > max_age {
                track.state = TrackState::Lost;
                info!(
                    "👻 Track H{} LOST (silent {:.1}s, conf={:.2})",
                    track.id,
                    track.silent_age_ms(now_ms) / 1000.0,
                    track.confidence()
                );
                report.lost.push(track.id);
            }
        }
    }

    fn prune(&mut self, now_ms: f64, report: &mut TrackerUpdate) {
        let floor = self.config.removal_confidence_floor;
        let hard_max = self.config.hard_max_age_ms;
        let removed = &mut report.removed;
        self.tracks.retain(|t| {
            if t.confidence() < floor {
                info!(
                    "🗑️  Track H{} removed (confidence {:.3} < {:.2})",
                    t.id,
                    t.confidence(),
                    floor
                );
                removed.push(t.id);
                return false;
            }
            if t.silent_age_ms(now_ms) > hard_max {
                info!(
                    "🗑️  Track H{} removed (silent {:.1}s)",
                    t.id,
                    t.silent_age_ms(now_ms) / 1000.0
                );
                removed.push(t.id);
                return false;
            }
            true
        });
    }

    /// Move every spatial track into the current camera frame.
    pub fn apply_ego_motion(&mut self, delta: &EgoMotionDelta) {
        let motion = delta.isometry();
        for track in &mut self.tracks {
            if track.positioning != Positioning::Spatial {
                continue;
            }
            track.position = super::ego_motion::compensate_with(&motion, &track.position);
            track.depth_m = track.position.z;
            for sample in &mut track.history {
                sample.position = super::ego_motion::compensate_with(&motion, &sample.position);
            }
        }
    }

    /// Merge a late result detected at `detection_ts_ms`. Hazard positions
    /// must already be in the current camera frame.
    ///
    /// Matched tracks gain a history sample; their measurement only changes
    /// when the late sample is newer than the last update. No decay, no pruning.
    pub fn merge_late(
        &mut self,
        hazards: &mut [SpatialHazard],
        detection_ts_ms: f64,
        now_ms: f64,
    ) -> TrackerUpdate {
        let mut report = TrackerUpdate::default();
        let assignments = self.associate(hazards);
        let mut matched_dets = vec![false; hazards.len()];

        for (ti, di) in assignments {
            matched_dets[di] = true;
            let capacity = self.config.history_capacity;
            let smoothing = self.config.position_smoothing;
            let track = &mut self.tracks[ti];
            let hazard = &mut hazards[di];

            track.push_sample(
                HistorySample {
                    timestamp_ms: detection_ts_ms,
                    position: hazard.position,
                    confidence: hazard.confidence,
                },
                capacity,
            );
            track.detection_count += 1;
            if detection_ts_ms > track.last_update_ms {
                track.absorb(hazard, detection_ts_ms, smoothing);
            } else {
                debug!(
                    "Late sample for H{} at {:.0}ms is older than last update {:.0}ms; history only",
                    track.id, detection_ts_ms, track.last_update_ms
                );
            }
            hazard.tracking_id = Some(track.id);
            report.matched += 1;

            if track.check_established(&self.config, now_ms) {
                info!(
                    "✅ Track H{} ESTABLISHED via late result ({} detections)",
                    track.id, track.detection_count
                );
                report.promoted.push(track.id);
            }
        }

        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let id = self.spawn(&mut hazards[di], detection_ts_ms);
                report.created.push(id);
            }
        }
        report
    }

    /// History of the nearest live track this detection could join.
    pub fn temporal_evidence(
        &self,
        class: &HazardClass,
        positioning: Positioning,
        position: &Position3,
    ) -> Option<TemporalEvidence> {
        let gate = self.config.gate(positioning);
        self.tracks
            .iter()
            .filter(|t| {
                t.state != TrackState::Lost && t.positioning == positioning && &t.class == class
            })
            .map(|t| (t, (t.position - position).norm()))
            .filter(|(_, dist)| *dist <= gate)
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.id.cmp(&b.0.id))
            })
            .map(|(t, _)| TemporalEvidence {
                track_id: t.id,
                state: t.state,
                sample_times_ms: t.history.iter().map(|s| s.timestamp_ms).collect(),
            })
    }

    pub fn snapshot(&self, frame_id: u64, at_ms: f64) -> TrackerSnapshot {
        TrackerSnapshot {
            frame_id,
            timestamp_ms: at_ms,
            tracks: self.tracks.iter().map(|t| t.snapshot(at_ms)).collect(),
        }
    }

    /// Current TENTATIVE and ESTABLISHED tracks as overlay hazards.
    pub fn live_hazards(&self, at_ms: f64) -> Vec<SpatialHazard> {
        self.tracks
            .iter()
            .filter(|t| t.state != TrackState::Lost)
            .map(|t| t.to_hazard(at_ms))
            .collect()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hazard(class: &str, x: f64, y: f64, z: f64, conf: f32) -> SpatialHazard {
        SpatialHazard {
            id: Uuid::new_v4(),
            tracking_id: None,
            class: HazardClass::new(class),
            position: Position3::new(x, y, z),
            extent: Extent3 {
                width: 0.5,
                height: 1.7,
                depth: 0.5,
            },
            source_bbox: BoundingBox::new(300.0, 100.0, 50.0, 170.0),
            positioning: Positioning::Spatial,
            depth_m: z,
            uncertainty_m: 0.5,
            confidence: conf,
            factors: FactorBreakdown {
                detection: conf,
                spatial: 0.8,
                temporal: 0.0,
                environmental: 0.5,
                decay: 1.0,
                penalties: Vec::new(),
            },
            merged_detections: 1,
            severity: None,
            timestamp_ms: 0.0,
        }
    }

    fn tracker() -> HazardTracker {
        HazardTracker::new(TrackerConfig::default())
    }

    #[test]
    fn test_default_config_valid() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            confidence_decay: 1.5,
            ..TrackerConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = TrackerConfig {
            hard_max_age_ms: 5_000.0,
            ..TrackerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_track_lifecycle_one_second_frames() {
        let mut tracker = tracker();

        // Frame 1: created TENTATIVE
        let mut dets = vec![hazard("person", 0.5, 0.0, 6.0, 0.8)];
        let report = tracker.update(&mut dets, 0.0);
        assert_eq!(report.created.len(), 1);
        let id = dets[0].tracking_id.unwrap();
        let snap = tracker.snapshot(1, 0.0);
        assert_eq!(snap.get(id).unwrap().state, TrackState::Tentative);
        assert_eq!(snap.get(id).unwrap().detection_count, 1);

        // Frames 2, 3: matched, ESTABLISHED at frame 3
        for (frame, ts) in [(2u64, 1000.0), (3, 2000.0)] {
            let mut dets = vec![hazard("person", 0.5, 0.0, 6.0, 0.8)];
            tracker.update(&mut dets, ts);
            assert_eq!(dets[0].tracking_id, Some(id));
            let state = tracker.snapshot(frame, ts).get(id).unwrap().state;
            if frame == 2 {
                assert_eq!(state, TrackState::Tentative);
            } else {
                assert_eq!(state, TrackState::Established);
            }
        }

        // Frames 4..=13: silent up to exactly 10s, still live
        for frame in 4..=13u64 {
            let ts = (frame - 1) as f64 * 1000.0;
            tracker.update(&mut [], ts);
            assert_eq!(
                tracker.snapshot(frame, ts).get(id).unwrap().state,
                TrackState::Established,
                "frame {}",
                frame
            );
        }

        // Frame 14: silent 11s → LOST
        let report = tracker.update(&mut [], 13_000.0);
        assert_eq!(report.lost, vec![id]);
        assert_eq!(tracker.snapshot(14, 13_000.0).get(id).unwrap().state, TrackState::Lost);

        // Eventually removed
        let mut removed_at = None;
        for frame in 15..=60u64 {
            let ts = (frame - 1) as f64 * 1000.0;
            if tracker.update(&mut [], ts).removed.contains(&id) {
                removed_at = Some(ts);
                break;
            }
        }
        let removed_at = removed_at.expect("track should be removed");
        assert!(removed_at <= 33_000.0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_establishment_requires_samples_inside_window() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("crane", 0.0, 0.0, 10.0, 0.9)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        // 4s apart: only two samples ever fall inside a 5s window
        for ts in [4_000.0, 8_000.0] {
            let mut dets = vec![hazard("crane", 0.0, 0.0, 10.0, 0.9)];
            tracker.update(&mut dets, ts);
        }
        assert_eq!(tracker.snapshot(3, 8_000.0).get(id).unwrap().state, TrackState::Tentative);
    }

    #[test]
    fn test_unmatched_tracks_decay_each_association_step() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("barrier", 1.0, 0.0, 5.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        tracker.update(&mut [], 100.0);
        tracker.update(&mut [], 200.0);
        let conf = tracker.snapshot(0, 200.0).get(id).unwrap().confidence;
        assert!((conf - 0.8 * 0.95 * 0.95).abs() < 1e-6);

        let live = tracker.live_hazards(200.0);
        assert!((live[0].factors.decay - 0.9025).abs() < 1e-6);
        assert!((live[0].confidence - conf).abs() < 1e-6);
    }

    #[test]
    fn test_miss_count_resets_on_match() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("barrier", 1.0, 0.0, 5.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        tracker.update(&mut [], 100.0);
        tracker.update(&mut [], 200.0);
        // Tracker-only steps are not misses
        tracker.propagate(300.0);
        assert_eq!(tracker.snapshot(0, 300.0).get(id).unwrap().missed, 2);

        let mut again = vec![hazard("barrier", 1.1, 0.0, 5.0, 0.8)];
        tracker.update(&mut again, 400.0);
        assert_eq!(again[0].tracking_id, Some(id));
        assert_eq!(tracker.snapshot(0, 400.0).get(id).unwrap().missed, 0);
    }

    #[test]
    fn test_propagate_does_not_decay_live_tracks() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("barrier", 1.0, 0.0, 5.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        for i in 1..=5 {
            tracker.propagate(i as f64 * 100.0);
        }
        let conf = tracker.snapshot(0, 500.0).get(id).unwrap().confidence;
        assert!((conf - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_propagate_decays_lost_tracks() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("barrier", 1.0, 0.0, 5.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        let report = tracker.propagate(10_500.0);
        assert_eq!(report.lost, vec![id]);
        let before = tracker.snapshot(0, 10_500.0).get(id).unwrap().confidence;
        tracker.propagate(10_600.0);
        let after = tracker.snapshot(0, 10_600.0).get(id).unwrap().confidence;
        assert!((after - before * 0.95).abs() < 1e-6);
        assert!(tracker.live_hazards(10_600.0).is_empty());
    }

    #[test]
    fn test_lost_tracks_are_not_reassociated() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("truck", 0.0, 0.0, 8.0, 0.9)];
        tracker.update(&mut dets, 0.0);
        let old = dets[0].tracking_id.unwrap();
        tracker.propagate(11_000.0);

        let mut dets = vec![hazard("truck", 0.0, 0.0, 8.0, 0.9)];
        tracker.update(&mut dets, 11_100.0);
        let new = dets[0].tracking_id.unwrap();
        assert_ne!(old, new);
    }

    #[test]
    fn test_association_respects_class_and_gate() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("person", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 0.0);

        let mut dets = vec![
            hazard("hard_hat", 0.0, 0.0, 6.0, 0.8),
            hazard("person", 3.0, 0.0, 6.0, 0.8),
        ];
        let report = tracker.update(&mut dets, 100.0);
        assert_eq!(report.matched, 0);
        assert_eq!(report.created.len(), 2);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_equidistant_tie_prefers_higher_detection_confidence() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("person", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        // Two detections 1m either side of the track
        let mut dets = vec![
            hazard("person", -1.0, 0.0, 6.0, 0.6),
            hazard("person", 1.0, 0.0, 6.0, 0.9),
        ];
        tracker.update(&mut dets, 100.0);
        assert_eq!(dets[1].tracking_id, Some(id));
        assert_ne!(dets[0].tracking_id, Some(id));
    }

    #[test]
    fn test_equidistant_tracks_prefer_lower_id_when_confidence_equal() {
        let mut tracker = tracker();
        let mut dets = vec![
            hazard("cone", -1.0, 0.0, 6.0, 0.8),
            hazard("cone", 1.0, 0.0, 6.0, 0.8),
        ];
        tracker.update(&mut dets, 0.0);
        let first = dets[0].tracking_id.unwrap();

        let mut dets = vec![hazard("cone", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 100.0);
        assert_eq!(dets[0].tracking_id, Some(first));
    }

    #[test]
    fn test_position_smoothed_toward_measurement() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("person", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        let mut dets = vec![hazard("person", 1.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 100.0);
        let pos = tracker.snapshot(0, 100.0).get(id).unwrap().position;
        assert!((pos.x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ego_motion_moves_tracks() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("person", 0.5, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        tracker.apply_ego_motion(&EgoMotionDelta::translation(0.0, 0.0, 1.0));
        let pos = tracker.snapshot(0, 0.0).get(id).unwrap().position;
        assert!((pos.z - 5.0).abs() < 1e-9);
        assert!((pos.x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ego_motion_ignores_screen_space_tracks() {
        let mut tracker = tracker();
        let mut h = hazard("person", 0.4, 0.3, 0.0, 0.8);
        h.positioning = Positioning::ScreenSpace;
        let mut dets = vec![h];
        tracker.update(&mut dets, 0.0);
        let id = dets[0].tracking_id.unwrap();

        tracker.apply_ego_motion(&EgoMotionDelta::translation(0.0, 0.0, 1.0));
        let pos = tracker.snapshot(0, 0.0).get(id).unwrap().position;
        assert!((pos - Position3::new(0.4, 0.3, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_late_merge_older_sample_adds_history_only() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("excavator", 0.0, 0.0, 12.0, 0.7)];
        tracker.update(&mut dets, 1_000.0);
        let id = dets[0].tracking_id.unwrap();
        let mut dets = vec![hazard("excavator", 0.0, 0.0, 12.0, 0.7)];
        tracker.update(&mut dets, 2_000.0);

        // Background result detected at 1500ms arrives at 2100ms
        let mut late = vec![hazard("excavator", 1.0, 0.0, 12.0, 0.95)];
        let report = tracker.merge_late(&mut late, 1_500.0, 2_100.0);
        assert_eq!(report.matched, 1);
        assert_eq!(late[0].tracking_id, Some(id));

        let snap = tracker.snapshot(0, 2_100.0);
        let t = snap.get(id).unwrap();
        assert_eq!(t.detection_count, 3);
        assert_eq!(t.state, TrackState::Established);
        assert!((t.position.x - 0.0).abs() < 1e-9, "newer position kept");
        assert!((t.confidence - 0.7).abs() < 1e-6);
        assert_eq!(t.last_update_ms, 2_000.0);

        let evidence = tracker
            .temporal_evidence(&HazardClass::new("excavator"), Positioning::Spatial, &Position3::new(0.0, 0.0, 12.0))
            .unwrap();
        assert_eq!(evidence.sample_times_ms, vec![1_000.0, 1_500.0, 2_000.0]);
    }

    #[test]
    fn test_late_merge_newer_sample_updates_measurement() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("excavator", 0.0, 0.0, 12.0, 0.7)];
        tracker.update(&mut dets, 1_000.0);
        let id = dets[0].tracking_id.unwrap();

        let mut late = vec![hazard("excavator", 1.0, 0.0, 12.0, 0.95)];
        tracker.merge_late(&mut late, 1_500.0, 1_600.0);
        let snap = tracker.snapshot(0, 1_600.0);
        let t = snap.get(id).unwrap();
        assert!((t.position.x - 0.5).abs() < 1e-9);
        assert!((t.confidence - 0.95).abs() < 1e-6);
        assert_eq!(t.last_update_ms, 1_500.0);
    }

    #[test]
    fn test_late_merge_spawns_unmatched_with_detection_timestamp() {
        let mut tracker = tracker();
        let mut late = vec![hazard("fall_hazard", 2.0, 1.0, 4.0, 0.6)];
        let report = tracker.merge_late(&mut late, 3_000.0, 3_400.0);
        assert_eq!(report.created.len(), 1);
        let snap = tracker.snapshot(0, 3_400.0);
        assert_eq!(snap.tracks[0].last_update_ms, 3_000.0);
        assert!((snap.tracks[0].silent_age_ms - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_temporal_evidence_skips_lost_and_other_classes() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("person", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 0.0);

        let pos = Position3::new(0.2, 0.0, 6.0);
        assert!(tracker
            .temporal_evidence(&HazardClass::new("person"), Positioning::Spatial, &pos)
            .is_some());
        assert!(tracker
            .temporal_evidence(&HazardClass::new("crane"), Positioning::Spatial, &pos)
            .is_none());
        assert!(tracker
            .temporal_evidence(&HazardClass::new("person"), Positioning::ScreenSpace, &pos)
            .is_none());

        tracker.propagate(10_500.0);
        assert!(tracker
            .temporal_evidence(&HazardClass::new("person"), Positioning::Spatial, &pos)
            .is_none());
    }

    #[test]
    fn test_history_bounded() {
        let config = TrackerConfig {
            history_capacity: 4,
            ..TrackerConfig::default()
        };
        let mut tracker = HazardTracker::new(config);
        for i in 0..10 {
            let mut dets = vec![hazard("cone", 0.0, 0.0, 6.0, 0.8)];
            tracker.update(&mut dets, i as f64 * 100.0);
        }
        let evidence = tracker
            .temporal_evidence(&HazardClass::new("cone"), Positioning::Spatial, &Position3::new(0.0, 0.0, 6.0))
            .unwrap();
        assert_eq!(evidence.sample_times_ms.len(), 4);
        assert_eq!(evidence.sample_times_ms[0], 600.0);
    }

    #[test]
    fn test_reset() {
        let mut tracker = tracker();
        let mut dets = vec![hazard("cone", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 0.0);
        tracker.reset();
        assert!(tracker.is_empty());

        let mut dets = vec![hazard("cone", 0.0, 0.0, 6.0, 0.8)];
        tracker.update(&mut dets, 100.0);
        assert_eq!(dets[0].tracking_id, Some(1));
    }
}
