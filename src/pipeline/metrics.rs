// src/pipeline/metrics.rs
//
// Production observability. Per-frame FrameMetrics ride along with every
// FrameResult; PipelineMetrics aggregates them into shared counters that can
// be read from any thread.

use crate::types::AnalysisStrategy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// What happened while processing one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameMetrics {
    pub realtime_ms: Option<f64>,
    pub realtime_timed_out: bool,
    /// Real-time due but an overrunning call was still pending
    pub realtime_skipped: bool,
    pub detector_error: Option<String>,
    pub background_dispatched: bool,
    pub background_skipped: bool,
    pub geometry_degraded: bool,
    pub detections_received: usize,
    pub detections_dropped: usize,
    pub detections_merged: usize,
    pub hazards_emitted: usize,
    pub tracks_created: usize,
    pub tracks_promoted: usize,
    pub tracks_lost: usize,
    pub tracks_removed: usize,
    pub late_results_merged: usize,
    pub late_results_discarded: usize,
    pub late_detector_errors: usize,
    pub timestamp_clamped: bool,
    pub budget_exceeded: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub realtime_frames: Arc<AtomicU64>,
    pub background_frames: Arc<AtomicU64>,
    pub tracker_only_frames: Arc<AtomicU64>,
    pub realtime_timeouts: Arc<AtomicU64>,
    pub realtime_skipped: Arc<AtomicU64>,
    pub detector_failures: Arc<AtomicU64>,
    pub background_dispatches: Arc<AtomicU64>,
    pub background_skipped: Arc<AtomicU64>,
    pub late_results_merged: Arc<AtomicU64>,
    pub late_results_discarded: Arc<AtomicU64>,
    pub malformed_detections: Arc<AtomicU64>,
    pub degraded_frames: Arc<AtomicU64>,
    pub tracks_created: Arc<AtomicU64>,
    pub tracks_removed: Arc<AtomicU64>,
    pub budget_overruns: Arc<AtomicU64>,
    pub processing_time_us: Arc<AtomicU64>,
    pub last_frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            realtime_frames: Arc::new(AtomicU64::new(0)),
            background_frames: Arc::new(AtomicU64::new(0)),
            tracker_only_frames: Arc::new(AtomicU64::new(0)),
            realtime_timeouts: Arc::new(AtomicU64::new(0)),
            realtime_skipped: Arc::new(AtomicU64::new(0)),
            detector_failures: Arc::new(AtomicU64::new(0)),
            background_dispatches: Arc::new(AtomicU64::new(0)),
            background_skipped: Arc::new(AtomicU64::new(0)),
            late_results_merged: Arc::new(AtomicU64::new(0)),
            late_results_discarded: Arc::new(AtomicU64::new(0)),
            malformed_detections: Arc::new(AtomicU64::new(0)),
            degraded_frames: Arc::new(AtomicU64::new(0)),
            tracks_created: Arc::new(AtomicU64::new(0)),
            tracks_removed: Arc::new(AtomicU64::new(0)),
            budget_overruns: Arc::new(AtomicU64::new(0)),
            processing_time_us: Arc::new(AtomicU64::new(0)),
            last_frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    /// Fold one frame's record into the aggregate counters.
    pub fn record_frame(&self, strategy: AnalysisStrategy, processing_ms: f64, frame: &FrameMetrics) {
        self.inc(&self.total_frames);
        match strategy {
            AnalysisStrategy::RealTime => self.inc(&self.realtime_frames),
            AnalysisStrategy::Background => self.inc(&self.background_frames),
            AnalysisStrategy::TrackerOnly => self.inc(&self.tracker_only_frames),
        }
        if frame.realtime_timed_out {
            self.inc(&self.realtime_timeouts);
        }
        if frame.realtime_skipped {
            self.inc(&self.realtime_skipped);
        }
        if frame.detector_error.is_some() {
            self.inc(&self.detector_failures);
        }
        self.add(&self.detector_failures, frame.late_detector_errors);
        if frame.background_dispatched {
            self.inc(&self.background_dispatches);
        }
        if frame.background_skipped {
            self.inc(&self.background_skipped);
        }
        if frame.geometry_degraded {
            self.inc(&self.degraded_frames);
        }
        if frame.budget_exceeded {
            self.inc(&self.budget_overruns);
        }
        self.add(&self.late_results_merged, frame.late_results_merged);
        self.add(&self.late_results_discarded, frame.late_results_discarded);
        self.add(&self.malformed_detections, frame.detections_dropped);
        self.add(&self.tracks_created, frame.tracks_created);
        self.add(&self.tracks_removed, frame.tracks_removed);

        let us = (processing_ms.max(0.0) * 1000.0) as u64;
        self.processing_time_us.fetch_add(us, Ordering::Relaxed);
        self.set_timing(&self.last_frame_time_us, us);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let total_frames = self.total_frames.load(Ordering::Relaxed);
        let processing_us = self.processing_time_us.load(Ordering::Relaxed);
        MetricsSummary {
            total_frames,
            fps: self.fps(),
            realtime_frames: self.realtime_frames.load(Ordering::Relaxed),
            background_frames: self.background_frames.load(Ordering::Relaxed),
            tracker_only_frames: self.tracker_only_frames.load(Ordering::Relaxed),
            realtime_timeouts: self.realtime_timeouts.load(Ordering::Relaxed),
            realtime_skipped: self.realtime_skipped.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            background_dispatches: self.background_dispatches.load(Ordering::Relaxed),
            background_skipped: self.background_skipped.load(Ordering::Relaxed),
            late_results_merged: self.late_results_merged.load(Ordering::Relaxed),
            late_results_discarded: self.late_results_discarded.load(Ordering::Relaxed),
            malformed_detections: self.malformed_detections.load(Ordering::Relaxed),
            degraded_frames: self.degraded_frames.load(Ordering::Relaxed),
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            tracks_removed: self.tracks_removed.load(Ordering::Relaxed),
            budget_overruns: self.budget_overruns.load(Ordering::Relaxed),
            avg_processing_us: if total_frames > 0 {
                processing_us / total_frames
            } else {
                0
            },
            last_frame_us: self.last_frame_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub realtime_frames: u64,
    pub background_frames: u64,
    pub tracker_only_frames: u64,
    pub realtime_timeouts: u64,
    pub realtime_skipped: u64,
    pub detector_failures: u64,
    pub background_dispatches: u64,
    pub background_skipped: u64,
    pub late_results_merged: u64,
    pub late_results_discarded: u64,
    pub malformed_detections: u64,
    pub degraded_frames: u64,
    pub tracks_created: u64,
    pub tracks_removed: u64,
    pub budget_overruns: u64,
    pub avg_processing_us: u64,
    pub last_frame_us: u64,
    pub elapsed_secs: f64,
}
