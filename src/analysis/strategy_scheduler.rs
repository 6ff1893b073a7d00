// src/analysis/strategy_scheduler.rs
//
// Counter-driven analysis strategy selection.
// Decides per frame whether to call the real-time detector and whether to
// dispatch the background detector. Deterministic: the same frame sequence
// always yields the same plan.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Real-time detector runs every Nth frame
    pub realtime_every_n_frames: u32,
    /// Background detector is dispatched every Mth frame
    pub background_every_m_frames: u32,
    /// Hard wall-clock budget for one frame
    pub frame_budget_ms: f64,
    /// Sub-budget for the real-time detector
    pub realtime_timeout_ms: f64,
    /// Deadline for a background call before it is abandoned
    pub background_timeout_ms: f64,
    /// Budget reserved for mapping, scoring and tracking after detection
    pub tracker_reserve_ms: f64,
    /// Buffered late results waiting for the next cycle
    pub late_result_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            realtime_every_n_frames: 3,
            background_every_m_frames: 15,
            frame_budget_ms: 200.0,
            realtime_timeout_ms: 150.0,
            background_timeout_ms: 5_000.0,
            tracker_reserve_ms: 10.0,
            late_result_capacity: 16,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.realtime_every_n_frames == 0 {
            return Err(PipelineError::invalid_config(
                "scheduler.realtime_every_n_frames",
                "must be at least 1",
            ));
        }
        if self.background_every_m_frames == 0 {
            return Err(PipelineError::invalid_config(
                "scheduler.background_every_m_frames",
                "must be at least 1",
            ));
        }
        let durations = [
            ("scheduler.frame_budget_ms", self.frame_budget_ms),
            ("scheduler.realtime_timeout_ms", self.realtime_timeout_ms),
            ("scheduler.background_timeout_ms", self.background_timeout_ms),
        ];
        for (field, v) in durations {
            if !v.is_finite() || v <= 0.0 {
                return Err(PipelineError::invalid_config(
                    field,
                    format!("must be positive and finite, got {}", v),
                ));
            }
        }
        if !self.tracker_reserve_ms.is_finite()
            || self.tracker_reserve_ms < 0.0
            || self.tracker_reserve_ms >= self.frame_budget_ms
        {
            return Err(PipelineError::invalid_config(
                "scheduler.tracker_reserve_ms",
                "must be >= 0 and below frame_budget_ms",
            ));
        }
        if self.late_result_capacity == 0 {
            return Err(PipelineError::invalid_config(
                "scheduler.late_result_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// State of the background detector as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundSlot {
    /// No background detector configured
    Unavailable,
    Idle,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramePlan {
    pub run_realtime: bool,
    pub dispatch_background: bool,
    /// Background was due but a previous call is still pending
    pub background_skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_frames: u64,
    pub realtime_runs: u64,
    pub background_dispatches: u64,
    pub background_skipped: u64,
    pub realtime_frequency: f32,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct StrategyScheduler {
    config: SchedulerConfig,
    frames_since_realtime: u32,
    frames_since_background: u32,
    total_frames: u64,
    realtime_runs: u64,
    background_dispatches: u64,
    background_skipped: u64,
}

impl StrategyScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        // Start due so the very first frame seeds the tracker.
        let frames_since_realtime = config.realtime_every_n_frames;
        let frames_since_background = config.background_every_m_frames;
        Self {
            config,
            frames_since_realtime,
            frames_since_background,
            total_frames: 0,
            realtime_runs: 0,
            background_dispatches: 0,
            background_skipped: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Plan the current frame. Call exactly once per frame.
    pub fn plan(&mut self, background: BackgroundSlot) -> FramePlan {
        self.total_frames += 1;
        let mut plan = FramePlan::default();

        if self.frames_since_realtime >= self.config.realtime_every_n_frames {
            self.frames_since_realtime = 0;
            self.realtime_runs += 1;
            plan.run_realtime = true;
        }
        self.frames_since_realtime += 1;

        if self.frames_since_background >= self.config.background_every_m_frames {
            self.frames_since_background = 0;
            match background {
                BackgroundSlot::Idle => {
                    self.background_dispatches += 1;
                    plan.dispatch_background = true;
                }
                BackgroundSlot::InFlight => {
                    self.background_skipped += 1;
                    plan.background_skipped = true;
                }
                BackgroundSlot::Unavailable => {}
            }
        }
        self.frames_since_background += 1;

        debug!(
            "Frame plan #{}: realtime={} background={} skipped={}",
            self.total_frames, plan.run_realtime, plan.dispatch_background, plan.background_skipped
        );
        plan
    }

    /// Real-time sub-budget given the time already spent on this frame.
    pub fn realtime_budget_ms(&self, elapsed_ms: f64) -> f64 {
        let remaining = self.config.frame_budget_ms - self.config.tracker_reserve_ms - elapsed_ms;
        self.config.realtime_timeout_ms.min(remaining.max(0.0))
    }

    pub fn get_stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_frames: self.total_frames,
            realtime_runs: self.realtime_runs,
            background_dispatches: self.background_dispatches,
            background_skipped: self.background_skipped,
            realtime_frequency: if self.total_frames > 0 {
                self.realtime_runs as f32 / self.total_frames as f32
            } else {
                0.0
            },
        }
    }

    pub fn reset(&mut self) {
        self.frames_since_realtime = self.config.realtime_every_n_frames;
        self.frames_since_background = self.config.background_every_m_frames;
        self.total_frames = 0;
        self.realtime_runs = 0;
        self.background_dispatches = 0;
        self.background_skipped = 0;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_every_third_frame() {
        let mut scheduler = StrategyScheduler::new(SchedulerConfig::default());
        let runs: Vec<usize> = (0..12)
            .filter(|_| scheduler.plan(BackgroundSlot::Unavailable).run_realtime)
            .collect();
        assert_eq!(runs, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_background_every_fifteenth_frame_independent_counter() {
        let mut scheduler = StrategyScheduler::new(SchedulerConfig::default());
        let mut dispatched = Vec::new();
        for frame in 0..31 {
            if scheduler.plan(BackgroundSlot::Idle).dispatch_background {
                dispatched.push(frame);
            }
        }
        assert_eq!(dispatched, vec![0, 15, 30]);
        assert_eq!(scheduler.get_stats().realtime_runs, 11);
    }

    #[test]
    fn test_background_skipped_while_in_flight() {
        let mut scheduler = StrategyScheduler::new(SchedulerConfig::default());
        assert!(scheduler.plan(BackgroundSlot::Idle).dispatch_background);
        for _ in 1..15 {
            scheduler.plan(BackgroundSlot::InFlight);
        }
        let plan = scheduler.plan(BackgroundSlot::InFlight);
        assert!(!plan.dispatch_background);
        assert!(plan.background_skipped);
        assert_eq!(scheduler.get_stats().background_skipped, 1);

        // Cadence is preserved: next due frame is 15 frames later
        for _ in 16..30 {
            assert!(!scheduler.plan(BackgroundSlot::Idle).dispatch_background);
        }
        assert!(scheduler.plan(BackgroundSlot::Idle).dispatch_background);
    }

    #[test]
    fn test_no_background_without_detector() {
        let mut scheduler = StrategyScheduler::new(SchedulerConfig::default());
        for _ in 0..30 {
            let plan = scheduler.plan(BackgroundSlot::Unavailable);
            assert!(!plan.dispatch_background && !plan.background_skipped);
        }
    }

    #[test]
    fn test_realtime_budget_capped_by_remaining_frame_time() {
        let scheduler = StrategyScheduler::new(SchedulerConfig::default());
        assert_eq!(scheduler.realtime_budget_ms(0.0), 150.0);
        assert_eq!(scheduler.realtime_budget_ms(90.0), 100.0);
        assert_eq!(scheduler.realtime_budget_ms(250.0), 0.0);
    }

    #[test]
    fn test_every_frame_when_n_is_one() {
        let config = SchedulerConfig {
            realtime_every_n_frames: 1,
            ..SchedulerConfig::default()
        };
        let mut scheduler = StrategyScheduler::new(config);
        assert!((0..5).all(|_| scheduler.plan(BackgroundSlot::Unavailable).run_realtime));
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let bad = SchedulerConfig {
            realtime_every_n_frames: 0,
            ..SchedulerConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = SchedulerConfig {
            tracker_reserve_ms: 250.0,
            ..SchedulerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_reset_restarts_cadence() {
        let mut scheduler = StrategyScheduler::new(SchedulerConfig::default());
        scheduler.plan(BackgroundSlot::Idle);
        scheduler.plan(BackgroundSlot::Idle);
        scheduler.reset();
        let plan = scheduler.plan(BackgroundSlot::Idle);
        assert!(plan.run_realtime && plan.dispatch_background);
        assert_eq!(scheduler.get_stats().total_frames, 1);
    }
}
