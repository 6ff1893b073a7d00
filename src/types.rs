// src/types.rs
//
// Shared data contracts: what comes in from the camera and the detector,
// and what goes out to the overlay renderer.

use crate::analysis::ego_motion::EgoMotionDelta;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::metrics::FrameMetrics;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Camera-frame position in meters (x right, y down, z forward), or
/// normalized image coordinates for screen-space hazards.
pub type Position3 = Vector3<f64>;

// ============================================================================
// CLASS / SEVERITY
// ============================================================================

/// Stable hazard class identifier. Normalized so detector spelling variants
/// ("no-hardhat", "No Hardhat") resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct HazardClass(String);

impl HazardClass {
    pub fn new(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for HazardClass {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&str> for HazardClass {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<HazardClass> for String {
    fn from(class: HazardClass) -> Self {
        class.0
    }
}

impl fmt::Display for HazardClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Passed through from upstream; the core never derives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

// ============================================================================
// CAMERA GEOMETRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn validate(&self) -> PipelineResult<()> {
        let params = [
            ("fx", self.fx),
            ("fy", self.fy),
            ("cx", self.cx),
            ("cy", self.cy),
        ];
        for (name, value) in params {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipelineError::MissingGeometry(format!(
                    "intrinsic {} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::MissingGeometry(format!(
                "image size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Pixel bounding box, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width / self.height
    }

    /// True when any side lies within `margin` px of the image border.
    /// Boxes cut by the frame edge under-report their real height.
    pub fn touches_edge(&self, image_w: f64, image_h: f64, margin: f64) -> bool {
        self.x <= margin
            || self.y <= margin
            || self.right() >= image_w - margin
            || self.bottom() >= image_h - margin
    }

    fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }
}

// ============================================================================
// DETECTOR OUTPUT
// ============================================================================

/// One raw detection as reported by an external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection2D {
    pub class: HazardClass,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub timestamp_ms: f64,
    #[serde(default)]
    pub severity: Option<Severity>,
}

impl Detection2D {
    pub fn new(class: impl Into<HazardClass>, bbox: BoundingBox, confidence: f32, timestamp_ms: f64) -> Self {
        Self {
            class: class.into(),
            bbox,
            confidence,
            timestamp_ms,
            severity: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Shape checks that do not depend on configuration. Class resolution
    /// happens in the mapper against the reference table.
    pub fn check_well_formed(&self) -> PipelineResult<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(PipelineError::malformed(
                self.class.as_str(),
                format!("confidence {} outside [0, 1]", self.confidence),
            ));
        }
        if !self.bbox.is_well_formed() {
            return Err(PipelineError::malformed(
                self.class.as_str(),
                format!(
                    "bbox {:.1}x{:.1} at ({:.1}, {:.1}) is not a positive finite box",
                    self.bbox.width, self.bbox.height, self.bbox.x, self.bbox.y
                ),
            ));
        }
        if self.class.as_str().is_empty() {
            return Err(PipelineError::malformed("", "empty class"));
        }
        Ok(())
    }
}

// ============================================================================
// SPATIAL HAZARD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Positioning {
    /// Metric camera-frame coordinates from the pinhole model.
    Spatial,
    /// Normalized image coordinates; intrinsics were unavailable.
    ScreenSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent3 {
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidencePenalty {
    MissingGeometry,
    UnknownClass,
    TruncatedBox,
}

/// Per-factor confidence diagnostics. Emitted confidence is always
/// `clamp(weighted sum, 0, 1) * decay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorBreakdown {
    pub detection: f32,
    pub spatial: f32,
    pub temporal: f32,
    pub environmental: f32,
    pub decay: f32,
    pub penalties: Vec<ConfidencePenalty>,
}

impl FactorBreakdown {
    pub fn has_penalty(&self, penalty: ConfidencePenalty) -> bool {
        self.penalties.contains(&penalty)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpatialHazard {
    /// Per-frame id, regenerated every frame.
    pub id: Uuid,
    /// Stable identity assigned by the tracker.
    pub tracking_id: Option<u64>,
    pub class: HazardClass,
    pub position: Position3,
    pub extent: Extent3,
    pub source_bbox: BoundingBox,
    pub positioning: Positioning,
    pub depth_m: f64,
    pub uncertainty_m: f64,
    pub confidence: f32,
    pub factors: FactorBreakdown,
    pub merged_detections: u32,
    pub severity: Option<Severity>,
    pub timestamp_ms: f64,
}

// ============================================================================
// FRAME IN / RESULT OUT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStrategy {
    RealTime,
    Background,
    TrackerOnly,
}

impl AnalysisStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RealTime => "REALTIME",
            Self::Background => "BACKGROUND",
            Self::TrackerOnly => "TRACKER_ONLY",
        }
    }
}

/// One camera frame handed to the analyzer. Pixel data is RGB8 and shared
/// with detector tasks that may outlive the frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub intrinsics: Option<CameraIntrinsics>,
    pub ego_motion: Option<EgoMotionDelta>,
    /// Blur/exposure score in [0, 1] from the capture layer.
    pub quality: Option<f32>,
    pub work_context: Option<String>,
}

impl Frame {
    pub fn new(frame_id: u64, timestamp_ms: f64, width: u32, height: u32) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            data: Arc::from(Vec::<u8>::new()),
            width,
            height,
            intrinsics: None,
            ego_motion: None,
            quality: None,
            work_context: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Arc::from(data);
        self
    }

    pub fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = Some(intrinsics);
        self
    }

    pub fn with_ego_motion(mut self, delta: EgoMotionDelta) -> Self {
        self.ego_motion = Some(delta);
        self
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_work_context(mut self, context: impl Into<String>) -> Self {
        self.work_context = Some(context.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameResult {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub hazards: Vec<SpatialHazard>,
    pub strategy: AnalysisStrategy,
    pub processing_time_ms: f64,
    pub aggregate_confidence: f32,
    pub metrics: FrameMetrics,
}

pub fn aggregate_confidence(hazards: &[SpatialHazard]) -> f32 {
    if hazards.is_empty() {
        return 0.0;
    }
    hazards.iter().map(|h| h.confidence).sum::<f32>() / hazards.len() as f32
}
