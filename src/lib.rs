// src/lib.rs
//
// Hazard overlay core: turns intermittent 2D hazard detections into
// temporally stable, depth-positioned hazards for a live camera overlay.

pub mod analysis;
pub mod config;
pub mod detection;
pub mod error;
pub mod pipeline;
pub mod types;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{FrameAnalyzer, SnapshotReader};
pub use types::{Frame, FrameResult, SpatialHazard};
