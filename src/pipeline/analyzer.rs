// src/pipeline/analyzer.rs
//
// Per-frame orchestration: pick a strategy, optionally run detectors, map,
// score, track, and emit a FrameResult inside the frame budget.
//
// Flow per frame:
//   1. Ego-motion: move tracks into the current camera frame
//   2. Drain late results (background, or real-time calls that overran)
//   3. Plan: real-time every Nth frame, background every Mth frame
//   4. Real-time call under its sub-budget; overrun → tracker-only
//   5. Map → score → track, publish snapshot, emit result
//
// The tracker has exactly one writer (this struct). Detector calls run as
// tokio tasks and hand results back through a channel that is drained at
// the start of the next cycle, never mid-update.

use crate::analysis::confidence_scorer::{ConfidenceScorer, ScorerConfig, ScoringInput};
use crate::analysis::ego_motion::{compensate_with, EgoMotionDelta};
use crate::analysis::hazard_tracker::{HazardTracker, TrackerConfig, TrackerSnapshot, TrackerUpdate};
use crate::analysis::spatial_mapper::{MappedDetection, MapperConfig, SpatialMapper};
use crate::analysis::strategy_scheduler::{
    BackgroundSlot, SchedulerConfig, SchedulerStats, StrategyScheduler,
};
use crate::detection::{DetectionRequest, DetectorRole, HazardDetector};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::ego_buffer::EgoMotionBuffer;
use crate::pipeline::metrics::{FrameMetrics, PipelineMetrics};
use crate::pipeline::snapshot::{SnapshotPublisher, SnapshotReader};
use crate::types::{
    aggregate_confidence, AnalysisStrategy, CameraIntrinsics, Detection2D, Frame, FrameResult,
    Positioning, SpatialHazard,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfig {
    pub scheduler: SchedulerConfig,
    pub mapper: MapperConfig,
    pub scorer: ScorerConfig,
    pub tracker: TrackerConfig,
}

impl AnalyzerConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        self.scheduler.validate()?;
        self.mapper.validate()?;
        self.scorer.validate()?;
        self.tracker.validate()?;
        Ok(())
    }
}

// ============================================================================
// LATE RESULTS
// ============================================================================

/// Frame context a detector result needs once it comes back late.
#[derive(Debug, Clone)]
struct LateContext {
    role: DetectorRole,
    frame_id: u64,
    detection_ts_ms: f64,
    width: u32,
    height: u32,
    intrinsics: Option<CameraIntrinsics>,
    quality: Option<f32>,
}

impl LateContext {
    fn new(frame: &Frame, role: DetectorRole) -> Self {
        Self {
            role,
            frame_id: frame.frame_id,
            detection_ts_ms: frame.timestamp_ms,
            width: frame.width,
            height: frame.height,
            intrinsics: frame.intrinsics,
            quality: frame.quality,
        }
    }

    fn with_outcome(self, outcome: PipelineResult<Vec<Detection2D>>) -> LateResult {
        LateResult {
            context: self,
            outcome,
        }
    }
}

#[derive(Debug)]
struct LateResult {
    context: LateContext,
    outcome: PipelineResult<Vec<Detection2D>>,
}

/// Clears a detector's in-flight flag when its task ends, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Release);
        Self(Arc::clone(flag))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

/// Run a detector under a deadline, folding the elapsed deadline into a
/// Timeout error.
async fn detect_with_deadline(
    detector: Arc<dyn HazardDetector>,
    request: DetectionRequest,
    deadline_ms: f64,
) -> PipelineResult<Vec<Detection2D>> {
    match tokio::time::timeout(millis(deadline_ms), detector.detect(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(PipelineError::Timeout {
            detector: detector.name().to_string(),
            budget_ms: deadline_ms,
        }),
    }
}

fn fold_report(fm: &mut FrameMetrics, report: &TrackerUpdate) {
    fm.tracks_created += report.created.len();
    fm.tracks_promoted += report.promoted.len();
    fm.tracks_lost += report.lost.len();
    fm.tracks_removed += report.removed.len();
}

// ============================================================================
// FRAME ANALYZER
// ============================================================================

pub struct FrameAnalyzer {
    scheduler: StrategyScheduler,
    mapper: SpatialMapper,
    scorer: ConfidenceScorer,
    tracker: HazardTracker,
    ego_buffer: EgoMotionBuffer,
    realtime: Arc<dyn HazardDetector>,
    background: Option<Arc<dyn HazardDetector>>,
    background_in_flight: Arc<AtomicBool>,
    realtime_in_flight: Arc<AtomicBool>,
    late_tx: mpsc::Sender<LateResult>,
    late_rx: mpsc::Receiver<LateResult>,
    publisher: SnapshotPublisher,
    metrics: PipelineMetrics,
    last_emitted_ms: Option<f64>,
    geometry_degraded: bool,
}

impl FrameAnalyzer {
    /// Validates the whole configuration; this is the only fatal error path.
    pub fn new(
        config: AnalyzerConfig,
        realtime: Arc<dyn HazardDetector>,
        background: Option<Arc<dyn HazardDetector>>,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let window = config.tracker.temporal_window();
        let (late_tx, late_rx) = mpsc::channel(config.scheduler.late_result_capacity);

        info!(
            "🧭 Frame analyzer: realtime={} every {} frames, background={} every {} frames, budget={:.0}ms",
            realtime.name(),
            config.scheduler.realtime_every_n_frames,
            background.as_ref().map(|b| b.name()).unwrap_or("none"),
            config.scheduler.background_every_m_frames,
            config.scheduler.frame_budget_ms
        );

        Ok(Self {
            ego_buffer: EgoMotionBuffer::new(config.tracker.temporal_window_ms),
            scheduler: StrategyScheduler::new(config.scheduler),
            mapper: SpatialMapper::new(config.mapper),
            scorer: ConfidenceScorer::new(config.scorer, window),
            tracker: HazardTracker::new(config.tracker),
            realtime,
            background,
            background_in_flight: Arc::new(AtomicBool::new(false)),
            realtime_in_flight: Arc::new(AtomicBool::new(false)),
            late_tx,
            late_rx,
            publisher: SnapshotPublisher::new(),
            metrics: PipelineMetrics::new(),
            last_emitted_ms: None,
            geometry_degraded: false,
        })
    }

    pub fn subscribe(&self) -> SnapshotReader {
        self.publisher.subscribe()
    }

    pub fn latest_snapshot(&self) -> Arc<TrackerSnapshot> {
        self.publisher.latest()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.get_stats()
    }

    pub fn background_in_flight(&self) -> bool {
        self.background_in_flight.load(Ordering::Acquire)
    }

    /// True while a real-time call that missed its frame is still running.
    pub fn realtime_in_flight(&self) -> bool {
        self.realtime_in_flight.load(Ordering::Acquire)
    }

    /// Process one frame. Always yields a result; detector trouble only
    /// changes the strategy and the metrics.
    pub async fn process_frame(&mut self, frame: Frame) -> FrameResult {
        let started = Instant::now();
        let mut fm = FrameMetrics::default();
        let now_ms = frame.timestamp_ms;

        self.apply_ego_motion(&frame);
        self.drain_late_results(now_ms, &mut fm);

        let slot = match &self.background {
            None => BackgroundSlot::Unavailable,
            Some(_) if self.background_in_flight() => BackgroundSlot::InFlight,
            Some(_) => BackgroundSlot::Idle,
        };
        let plan = self.scheduler.plan(slot);
        if plan.background_skipped {
            debug!("Background call still pending, skipping dispatch on frame {}", frame.frame_id);
            fm.background_skipped = true;
        }
        if plan.dispatch_background {
            self.dispatch_background(&frame);
            fm.background_dispatched = true;
        }

        let detections = if !plan.run_realtime {
            None
        } else if self.realtime_in_flight() {
            debug!(
                "Real-time call from an earlier frame still pending, skipping frame {}",
                frame.frame_id
            );
            fm.realtime_skipped = true;
            None
        } else {
            self.run_realtime(&frame, started, &mut fm).await
        };

        let strategy = match detections {
            Some(detections) => {
                let report = self.apply_detections(&frame, detections, &mut fm);
                fold_report(&mut fm, &report);
                AnalysisStrategy::RealTime
            }
            None => {
                let report = self.tracker.propagate(now_ms);
                fold_report(&mut fm, &report);
                // A due real-time call that produced nothing is tracker-only,
                // whatever else was dispatched.
                if plan.dispatch_background && !plan.run_realtime {
                    AnalysisStrategy::Background
                } else {
                    AnalysisStrategy::TrackerOnly
                }
            }
        };

        let result_ts = match self.last_emitted_ms {
            Some(last) if now_ms < last => {
                warn!(
                    "⏪ Frame {} timestamp {:.0}ms is older than last result {:.0}ms; clamping",
                    frame.frame_id, now_ms, last
                );
                fm.timestamp_clamped = true;
                last
            }
            _ => now_ms,
        };
        self.last_emitted_ms = Some(result_ts);

        let hazards = self.tracker.live_hazards(result_ts);
        fm.hazards_emitted = hazards.len();
        self.publisher
            .publish(self.tracker.snapshot(frame.frame_id, result_ts));

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        let budget_ms = self.scheduler.config().frame_budget_ms;
        if processing_time_ms > budget_ms {
            warn!(
                "🐢 Frame {} took {:.1}ms (budget {:.0}ms)",
                frame.frame_id, processing_time_ms, budget_ms
            );
            fm.budget_exceeded = true;
        }
        self.metrics.record_frame(strategy, processing_time_ms, &fm);

        debug!(
            "Frame {} [{}] {:.1}ms: {} hazards, {} tracks",
            frame.frame_id,
            strategy.as_str(),
            processing_time_ms,
            hazards.len(),
            self.tracker.len()
        );

        FrameResult {
            frame_id: frame.frame_id,
            timestamp_ms: result_ts,
            aggregate_confidence: aggregate_confidence(&hazards),
            hazards,
            strategy,
            processing_time_ms,
            metrics: fm,
        }
    }

    fn apply_ego_motion(&mut self, frame: &Frame) {
        let delta = match frame.ego_motion {
            Some(delta) if delta.is_finite() => delta,
            Some(_) => {
                warn!("Non-finite ego-motion on frame {}; ignoring", frame.frame_id);
                EgoMotionDelta::identity()
            }
            None => EgoMotionDelta::identity(),
        };
        self.ego_buffer.push(frame.timestamp_ms, delta);
        if delta != EgoMotionDelta::identity() {
            self.tracker.apply_ego_motion(&delta);
        }
    }

    fn dispatch_background(&self, frame: &Frame) {
        let Some(detector) = self.background.as_ref().map(Arc::clone) else {
            return;
        };
        let request = DetectionRequest::from(frame);
        let context = LateContext::new(frame, DetectorRole::Background);
        let deadline_ms = self.scheduler.config().background_timeout_ms;
        let late_tx = self.late_tx.clone();
        let guard = InFlightGuard::raise(&self.background_in_flight);

        info!(
            "🛰️  Background {} dispatched for frame {}",
            detector.name(),
            frame.frame_id
        );
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = detect_with_deadline(detector, request, deadline_ms).await;
            if late_tx.send(context.with_outcome(outcome)).await.is_err() {
                debug!("Analyzer gone; dropping background result");
            }
        });
    }

    /// Real-time call under its sub-budget. None means tracker-only.
    async fn run_realtime(
        &self,
        frame: &Frame,
        started: Instant,
        fm: &mut FrameMetrics,
    ) -> Option<Vec<Detection2D>> {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let budget_ms = self.scheduler.realtime_budget_ms(elapsed_ms);
        if budget_ms <= 0.0 {
            warn!("⏱️  No budget left for real-time detection on frame {}", frame.frame_id);
            fm.realtime_timed_out = true;
            return None;
        }

        let (tx, mut rx) = oneshot::channel();
        let detector = Arc::clone(&self.realtime);
        let request = DetectionRequest::from(frame);
        let context = LateContext::new(frame, DetectorRole::Realtime);
        let task_context = context.clone();
        let late_tx = self.late_tx.clone();
        let deadline_ms = self.scheduler.config().background_timeout_ms;

        let guard = InFlightGuard::raise(&self.realtime_in_flight);

        let call_started = Instant::now();
        tokio::spawn(async move {
            let _guard = guard;
            let outcome = detect_with_deadline(detector, request, deadline_ms).await;
            if let Err(outcome) = tx.send(outcome) {
                // Frame already moved on; merge by timestamp next cycle.
                let _ = late_tx.send(task_context.with_outcome(outcome)).await;
            }
        });

        match tokio::time::timeout(millis(budget_ms), &mut rx).await {
            Ok(Ok(Ok(detections))) => {
                fm.realtime_ms = Some(call_started.elapsed().as_secs_f64() * 1000.0);
                fm.detections_received = detections.len();
                Some(detections)
            }
            Ok(Ok(Err(e))) => {
                warn!("⚠️  Real-time detector failed on frame {}: {}", frame.frame_id, e);
                fm.detector_error = Some(e.to_string());
                None
            }
            Ok(Err(_)) => {
                let e = PipelineError::unavailable(self.realtime.name(), "detector task aborted");
                warn!("⚠️  {}", e);
                fm.detector_error = Some(e.to_string());
                None
            }
            Err(_) => {
                warn!(
                    "⏱️  Real-time detector exceeded {:.0}ms on frame {}; tracker-only",
                    budget_ms, frame.frame_id
                );
                fm.realtime_timed_out = true;
                rx.close();
                // Finished in the gap between the deadline and close().
                if let Ok(outcome) = rx.try_recv() {
                    let _ = self.late_tx.try_send(context.with_outcome(outcome));
                }
                None
            }
        }
    }

    fn apply_detections(
        &mut self,
        frame: &Frame,
        detections: Vec<Detection2D>,
        fm: &mut FrameMetrics,
    ) -> TrackerUpdate {
        let mapped = self.mapper.map_frame(
            &detections,
            frame.intrinsics.as_ref(),
            frame.width,
            frame.height,
        );
        fm.detections_dropped += mapped.dropped.len();
        fm.detections_merged += mapped.merged;
        self.note_geometry(frame.frame_id, mapped.geometry_error.as_ref());
        fm.geometry_degraded = mapped.geometry_error.is_some();

        let mut hazards: Vec<SpatialHazard> = mapped
            .detections
            .into_iter()
            .map(|m| self.score(m, frame.quality, frame.timestamp_ms))
            .collect();
        self.tracker.update(&mut hazards, frame.timestamp_ms)
    }

    fn note_geometry(&mut self, frame_id: u64, error: Option<&PipelineError>) {
        match (error, self.geometry_degraded) {
            (Some(e), false) => {
                warn!("📐 Frame {}: {}; emitting screen-space hazards", frame_id, e);
                self.geometry_degraded = true;
            }
            (None, true) => {
                info!("📐 Frame {}: camera geometry restored", frame_id);
                self.geometry_degraded = false;
            }
            _ => {}
        }
    }

    fn drain_late_results(&mut self, now_ms: f64, fm: &mut FrameMetrics) {
        let window_ms = self.tracker.config().temporal_window_ms;

        while let Ok(late) = self.late_rx.try_recv() {
            let ctx = late.context;
            let detections = match late.outcome {
                Ok(detections) => detections,
                Err(e) => {
                    warn!("⚠️  Late {} result for frame {} failed: {}", ctx.role.as_str(), ctx.frame_id, e);
                    fm.late_detector_errors += 1;
                    continue;
                }
            };

            let age_ms = now_ms - ctx.detection_ts_ms;
            if age_ms > window_ms {
                warn!(
                    "🗑️  Discarding {} result for frame {}: {:.0}ms old (window {:.0}ms)",
                    ctx.role.as_str(),
                    ctx.frame_id,
                    age_ms,
                    window_ms
                );
                fm.late_results_discarded += 1;
                continue;
            }

            let mapped = self.mapper.map_frame(
                &detections,
                ctx.intrinsics.as_ref(),
                ctx.width,
                ctx.height,
            );
            fm.detections_dropped += mapped.dropped.len();
            fm.detections_merged += mapped.merged;

            let motion = self.ego_buffer.motion_since(ctx.detection_ts_ms);
            let mut hazards: Vec<SpatialHazard> = mapped
                .detections
                .into_iter()
                .map(|mut m| {
                    if m.estimate.positioning == Positioning::Spatial {
                        m.estimate.position = compensate_with(&motion, &m.estimate.position);
                        m.estimate.depth_m = m.estimate.position.z;
                    }
                    self.score(m, ctx.quality, ctx.detection_ts_ms)
                })
                .collect();

            let report = self
                .tracker
                .merge_late(&mut hazards, ctx.detection_ts_ms, now_ms);
            fold_report(fm, &report);
            fm.late_results_merged += 1;
            info!(
                "📥 Late {} result for frame {} merged: {} hazards ({} matched, {} new), {:.0}ms old",
                ctx.role.as_str(),
                ctx.frame_id,
                hazards.len(),
                report.matched,
                report.created.len(),
                age_ms
            );
        }
    }

    fn score(&self, m: MappedDetection, quality: Option<f32>, at_ms: f64) -> SpatialHazard {
        let evidence = self.tracker.temporal_evidence(
            &m.detection.class,
            m.estimate.positioning,
            &m.estimate.position,
        );
        let scored = self.scorer.score(&ScoringInput {
            detection_confidence: m.detection.confidence,
            uncertainty_m: m.estimate.uncertainty_m,
            positioning: m.estimate.positioning,
            penalties: &m.estimate.penalties,
            evidence: evidence.as_ref(),
            quality,
            at_ms,
        });

        SpatialHazard {
            id: Uuid::new_v4(),
            tracking_id: None,
            class: m.detection.class,
            position: m.estimate.position,
            extent: m.estimate.extent,
            source_bbox: m.detection.bbox,
            positioning: m.estimate.positioning,
            depth_m: m.estimate.depth_m,
            uncertainty_m: m.estimate.uncertainty_m,
            confidence: scored.overall,
            factors: scored.factors,
            merged_detections: m.merged_detections,
            severity: m.detection.severity,
            timestamp_ms: at_ms,
        }
    }

    /// Forget all tracks and restart the strategy cadence.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.scheduler.reset();
        self.ego_buffer.clear();
        while self.late_rx.try_recv().is_ok() {}
        self.last_emitted_ms = None;
        self.geometry_degraded = false;
        self.publisher.publish(TrackerSnapshot::default());
    }
}

// ============================================================================
// TESTS
// ============================================================================
