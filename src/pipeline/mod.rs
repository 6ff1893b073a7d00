// src/pipeline/mod.rs

pub mod analyzer;
pub mod ego_buffer;
pub mod metrics;
pub mod snapshot;

pub use analyzer::{AnalyzerConfig, FrameAnalyzer};
pub use ego_buffer::EgoMotionBuffer;
pub use metrics::{FrameMetrics, MetricsSummary, PipelineMetrics};
pub use snapshot::{SnapshotPublisher, SnapshotReader};
