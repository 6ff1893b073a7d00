// src/main.rs
//
// Replays a recorded session through the frame analyzer and writes one
// FrameResult JSON line per frame.

use anyhow::{Context, Result};
use hazard_overlay::analysis::ego_motion::EgoMotionDelta;
use hazard_overlay::config::Config;
use hazard_overlay::detection::{build_detector, DetectorRole};
use hazard_overlay::pipeline::{FrameAnalyzer, MetricsSummary};
use hazard_overlay::types::{CameraIntrinsics, Frame};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// One line of the frames file.
#[derive(Debug, Deserialize)]
struct FrameRecord {
    frame_id: u64,
    timestamp_ms: f64,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    intrinsics: Option<CameraIntrinsics>,
    #[serde(default)]
    ego_motion: Option<EgoMotionDelta>,
    #[serde(default)]
    quality: Option<f32>,
    #[serde(default)]
    work_context: Option<String>,
    /// Relative paths resolve against the frames file
    #[serde(default)]
    image_path: Option<PathBuf>,
}

impl FrameRecord {
    fn into_frame(self, base_dir: &Path) -> Result<Frame> {
        let mut frame = Frame::new(self.frame_id, self.timestamp_ms, self.width, self.height);
        if let Some(rel) = &self.image_path {
            let path = base_dir.join(rel);
            let rgb = image::open(&path)
                .with_context(|| format!("Failed to load frame image {}", path.display()))?
                .to_rgb8();
            frame.width = rgb.width();
            frame.height = rgb.height();
            frame = frame.with_data(rgb.into_raw());
        }
        frame.intrinsics = self.intrinsics;
        frame.ego_motion = self.ego_motion;
        frame.quality = self.quality;
        frame.work_context = self.work_context;
        Ok(frame)
    }
}

fn read_frames(path: &Path) -> Result<Vec<FrameRecord>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open frames file {}", path.display()))?;
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: FrameRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("Bad frame record at {}:{}", path.display(), line_no + 1))?;
        records.push(record);
    }
    Ok(records)
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output {}", path.display()))?;
            info!("💾 Results will be written to: {}", path.display());
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

fn log_summary(summary: &MetricsSummary) {
    info!("\n========================================");
    info!("✓ Session replayed");
    info!("  Total frames: {}", summary.total_frames);
    info!(
        "  Strategies: {} real-time, {} background, {} tracker-only",
        summary.realtime_frames, summary.background_frames, summary.tracker_only_frames
    );
    info!(
        "  Detector trouble: {} timeouts, {} skipped while pending, {} failures",
        summary.realtime_timeouts, summary.realtime_skipped, summary.detector_failures
    );
    info!(
        "  Background: {} dispatched, {} skipped",
        summary.background_dispatches, summary.background_skipped
    );
    info!(
        "  Late results: {} merged, {} discarded",
        summary.late_results_merged, summary.late_results_discarded
    );
    info!(
        "  Tracks: {} created, {} removed",
        summary.tracks_created, summary.tracks_removed
    );
    info!(
        "  Malformed detections: {}, degraded frames: {}, budget overruns: {}",
        summary.malformed_detections, summary.degraded_frames, summary.budget_overruns
    );
    info!(
        "  Avg processing: {:.2}ms ({:.1} FPS)",
        summary.avg_processing_us as f64 / 1000.0,
        summary.fps
    );
    info!("========================================");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("HAZARD_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🦺 Hazard Overlay starting");
    info!("✓ Configuration loaded from {}", config_path);

    let detections_path = config.replay.detections_path.as_deref();
    let realtime = build_detector(&config.detector.realtime, DetectorRole::Realtime, detections_path)?;
    let background = config
        .detector
        .background
        .as_ref()
        .map(|spec| build_detector(spec, DetectorRole::Background, detections_path))
        .transpose()?;
    info!("✓ Detectors ready");

    let mut analyzer = FrameAnalyzer::new(config.analyzer(), realtime, background)?;
    info!("✓ Frame analyzer ready");

    let frames_path = &config.replay.frames_path;
    let records = read_frames(frames_path)?;
    let base_dir = frames_path.parent().unwrap_or_else(|| Path::new("."));
    info!("📼 {} frames to replay from {}", records.len(), frames_path.display());

    let mut out = open_output(config.replay.output_path.as_deref())?;
    let session_start = tokio::time::Instant::now();
    let first_ts = records.first().map(|r| r.timestamp_ms).unwrap_or(0.0);

    for record in records {
        if config.replay.pace_to_timestamps {
            let offset_ms = (record.timestamp_ms - first_ts).max(0.0);
            let due = session_start + std::time::Duration::from_secs_f64(offset_ms / 1000.0);
            tokio::time::sleep_until(due).await;
        }

        let frame_id = record.frame_id;
        let frame = match record.into_frame(base_dir) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping frame {}: {:#}", frame_id, e);
                continue;
            }
        };

        let result = analyzer.process_frame(frame).await;
        serde_json::to_writer(&mut out, &result).context("Failed to write frame result")?;
        out.write_all(b"\n")?;
    }
    out.flush().context("Failed to flush results")?;

    log_summary(&analyzer.metrics().summary());
    Ok(())
}
