// src/detection/mod.rs
//
// Detector boundary. The detector itself is a black box returning 2D
// detections; the pipeline only depends on the HazardDetector trait.

mod remote;
mod replay;

pub use remote::{RemoteConfig, RemoteDetector};
pub use replay::{ReplayDetector, ReplayRecord};

use crate::error::PipelineResult;
use crate::types::{BoundingBox, Detection2D, Frame, Severity};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// What a detector gets to look at for one frame.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    /// RGB8, row-major
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub work_context: Option<String>,
}

impl From<&Frame> for DetectionRequest {
    fn from(frame: &Frame) -> Self {
        Self {
            frame_id: frame.frame_id,
            timestamp_ms: frame.timestamp_ms,
            data: Arc::clone(&frame.data),
            width: frame.width,
            height: frame.height,
            work_context: frame.work_context.clone(),
        }
    }
}

/// A hazard detector strategy (fast on-device, heavy remote, recorded...).
#[async_trait::async_trait]
pub trait HazardDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Detections are stamped with the request's timestamp.
    async fn detect(&self, request: DetectionRequest) -> PipelineResult<Vec<Detection2D>>;
}

/// Which scheduling slot a detector fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorRole {
    Realtime,
    Background,
}

impl DetectorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Background => "background",
        }
    }
}

/// Detection as it appears on the wire and in recordings: no timestamp, the
/// request supplies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDetection {
    #[serde(alias = "label")]
    pub class: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(default)]
    pub severity: Option<Severity>,
}

impl WireDetection {
    pub fn into_detection(self, timestamp_ms: f64) -> Detection2D {
        let mut det = Detection2D::new(self.class, self.bbox, self.confidence, timestamp_ms);
        det.severity = self.severity;
        det
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorSpec {
    /// Recorded detections from `replay.detections_path`
    Replay {
        #[serde(default)]
        latency_ms: f64,
    },
    /// HTTP detector service
    Remote(RemoteConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub realtime: DetectorSpec,
    /// None disables the background strategy
    pub background: Option<DetectorSpec>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            realtime: DetectorSpec::Replay { latency_ms: 20.0 },
            background: Some(DetectorSpec::Replay { latency_ms: 800.0 }),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> crate::error::PipelineResult<()> {
        validate_spec("detector.realtime", &self.realtime)?;
        if let Some(spec) = &self.background {
            validate_spec("detector.background", spec)?;
        }
        Ok(())
    }
}

fn validate_spec(field: &str, spec: &DetectorSpec) -> crate::error::PipelineResult<()> {
    match spec {
        DetectorSpec::Replay { latency_ms } => {
            if !latency_ms.is_finite() || *latency_ms < 0.0 {
                return Err(crate::error::PipelineError::invalid_config(
                    format!("{}.latency_ms", field),
                    format!("must be finite and >= 0, got {}", latency_ms),
                ));
            }
            Ok(())
        }
        DetectorSpec::Remote(remote) => remote.validate(field),
    }
}

/// Build the detector for `role`. Replay detectors load `detections_path`.
pub fn build_detector(
    spec: &DetectorSpec,
    role: DetectorRole,
    detections_path: Option<&Path>,
) -> Result<Arc<dyn HazardDetector>> {
    match spec {
        DetectorSpec::Replay { latency_ms } => {
            let path = detections_path.context("replay detector needs replay.detections_path")?;
            let detector = ReplayDetector::from_path(path, role, *latency_ms)
                .with_context(|| format!("Failed to load {} replay detections", role.as_str()))?;
            Ok(Arc::new(detector))
        }
        DetectorSpec::Remote(remote) => {
            let detector = RemoteDetector::new(remote.clone(), role)?;
            Ok(Arc::new(detector))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_detection_accepts_label_alias() {
        let json = r#"{"label":"No-Hardhat","bbox":{"x":1,"y":2,"width":3,"height":4},"confidence":0.7}"#;
        let wire: WireDetection = serde_json::from_str(json).unwrap();
        let det = wire.into_detection(1234.0);
        assert_eq!(det.class.as_str(), "no_hardhat");
        assert_eq!(det.timestamp_ms, 1234.0);
        assert!(det.severity.is_none());
    }

    #[test]
    fn test_detector_spec_yaml() {
        let yaml = "realtime:\n  kind: replay\n  latency_ms: 15\nbackground:\n  kind: remote\n  url: http://localhost:8080\n";
        let config: DetectorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.realtime, DetectorSpec::Replay { latency_ms } if latency_ms == 15.0));
        match &config.background {
            Some(DetectorSpec::Remote(remote)) => assert_eq!(remote.url, "http://localhost:8080"),
            other => panic!("unexpected background spec: {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_request_shares_frame_buffer() {
        let frame = Frame::new(7, 700.0, 2, 1).with_data(vec![1, 2, 3, 4, 5, 6]);
        let request = DetectionRequest::from(&frame);
        assert_eq!(request.frame_id, 7);
        assert!(Arc::ptr_eq(&request.data, &frame.data));
    }
}
