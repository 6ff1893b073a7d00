// src/detection/replay.rs
//
// Recorded detector. Serves per-frame detections from a JSONL file, one
// record per line:
//
//   {"frame_id": 12, "source": "background", "detections": [...]}
//
// Records without `source` feed both roles. A configurable latency
// simulates inference time so offline runs exercise the timeout paths.

use super::{DetectionRequest, DetectorRole, HazardDetector, WireDetection};
use crate::error::PipelineResult;
use crate::types::Detection2D;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub frame_id: u64,
    #[serde(default)]
    pub source: Option<DetectorRole>,
    #[serde(default)]
    pub detections: Vec<WireDetection>,
}

pub struct ReplayDetector {
    name: String,
    by_frame: HashMap<u64, Vec<WireDetection>>,
    latency: Duration,
}

impl ReplayDetector {
    pub fn from_records(
        records: impl IntoIterator<Item = ReplayRecord>,
        role: DetectorRole,
        latency_ms: f64,
    ) -> Self {
        let mut by_frame: HashMap<u64, Vec<WireDetection>> = HashMap::new();
        for record in records {
            if record.source.map(|s| s == role).unwrap_or(true) {
                by_frame
                    .entry(record.frame_id)
                    .or_default()
                    .extend(record.detections);
            }
        }
        Self {
            name: format!("replay-{}", role.as_str()),
            by_frame,
            latency: Duration::from_secs_f64(latency_ms.max(0.0) / 1000.0),
        }
    }

    pub fn from_path(path: &Path, role: DetectorRole, latency_ms: f64) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open detections file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<ReplayRecord>(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping {}:{}: {}", path.display(), line_no + 1, e);
                }
            }
        }

        let detector = Self::from_records(records, role, latency_ms);
        info!(
            "📼 Replay {} detector: {} frames with detections ({} bad lines) from {}",
            role.as_str(),
            detector.frame_count(),
            skipped,
            path.display()
        );
        Ok(detector)
    }

    pub fn frame_count(&self) -> usize {
        self.by_frame.len()
    }
}

#[async_trait::async_trait]
impl HazardDetector for ReplayDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, request: DetectionRequest) -> PipelineResult<Vec<Detection2D>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let detections: Vec<Detection2D> = self
            .by_frame
            .get(&request.frame_id)
            .map(|dets| {
                dets.iter()
                    .cloned()
                    .map(|d| d.into_detection(request.timestamp_ms))
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            "📼 {} → frame {}: {} detections",
            self.name,
            request.frame_id,
            detections.len()
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Frame};
    use std::io::Write;

    fn wire(class: &str) -> WireDetection {
        WireDetection {
            class: class.to_string(),
            bbox: BoundingBox::new(10.0, 10.0, 20.0, 40.0),
            confidence: 0.8,
            severity: None,
        }
    }

    #[tokio::test]
    async fn test_role_filtering() {
        let records = vec![
            ReplayRecord {
                frame_id: 1,
                source: None,
                detections: vec![wire("person")],
            },
            ReplayRecord {
                frame_id: 1,
                source: Some(DetectorRole::Background),
                detections: vec![wire("crane")],
            },
        ];
        let realtime = ReplayDetector::from_records(records.clone(), DetectorRole::Realtime, 0.0);
        let background = ReplayDetector::from_records(records, DetectorRole::Background, 0.0);

        let frame = Frame::new(1, 100.0, 640, 480);
        let rt = realtime.detect(DetectionRequest::from(&frame)).await.unwrap();
        let bg = background.detect(DetectionRequest::from(&frame)).await.unwrap();
        assert_eq!(rt.len(), 1);
        assert_eq!(bg.len(), 2);
        assert!(rt.iter().all(|d| d.timestamp_ms == 100.0));
    }

    #[tokio::test]
    async fn test_unknown_frame_is_empty() {
        let detector = ReplayDetector::from_records(Vec::new(), DetectorRole::Realtime, 0.0);
        let frame = Frame::new(99, 0.0, 640, 480);
        assert!(detector.detect(DetectionRequest::from(&frame)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_latency() {
        let detector = ReplayDetector::from_records(Vec::new(), DetectorRole::Realtime, 250.0);
        let frame = Frame::new(1, 0.0, 640, 480);
        let start = tokio::time::Instant::now();
        detector.detect(DetectionRequest::from(&frame)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_from_path_skips_bad_lines() {
        let path = std::env::temp_dir().join(format!("replay-{}.jsonl", uuid::Uuid::new_v4()));
        {
            let mut file = File::create(&path).unwrap();
            writeln!(file, "# recorded session").unwrap();
            writeln!(
                file,
                r#"{{"frame_id":0,"detections":[{{"class":"hard_hat","bbox":{{"x":1,"y":2,"width":3,"height":4}},"confidence":0.5}}]}}"#
            )
            .unwrap();
            writeln!(file, "not json").unwrap();
        }
        let detector = ReplayDetector::from_path(&path, DetectorRole::Realtime, 0.0).unwrap();
        assert_eq!(detector.frame_count(), 1);
        std::fs::remove_file(&path).unwrap();
    }
}
