// src/analysis/mod.rs
//
// Per-frame analysis stages.
//
// Signal flow:
//   Detection2D ─→ spatial_mapper ─→ confidence_scorer ─→ hazard_tracker ─→ SpatialHazard
//                  (reference_dimensions)   ↑ temporal evidence ─┘
//   EgoMotionDelta ─→ ego_motion ─→ hazard_tracker (re-projection)
//
// strategy_scheduler decides which detectors run on a frame; the stages are
// wired together by pipeline::analyzer::FrameAnalyzer.

pub mod confidence_scorer;
pub mod ego_motion;
pub mod hazard_tracker;
pub mod reference_dimensions;
pub mod spatial_mapper;
pub mod strategy_scheduler;

pub use confidence_scorer::{ConfidenceScorer, FactorWeights, ScorerConfig};
pub use ego_motion::EgoMotionDelta;
pub use hazard_tracker::{HazardTracker, TrackState, TrackerConfig, TrackerSnapshot};
pub use reference_dimensions::ReferenceDimensions;
pub use spatial_mapper::{MapperConfig, SpatialMapper};
pub use strategy_scheduler::{SchedulerConfig, StrategyScheduler};
