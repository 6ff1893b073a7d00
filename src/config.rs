// src/config.rs
//
// YAML configuration. Every section is optional and falls back to defaults;
// the whole tree is validated once at startup.

use crate::analysis::confidence_scorer::ScorerConfig;
use crate::analysis::hazard_tracker::TrackerConfig;
use crate::analysis::spatial_mapper::MapperConfig;
use crate::analysis::strategy_scheduler::SchedulerConfig;
use crate::detection::{DetectorConfig, DetectorSpec};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::analyzer::AnalyzerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub mapper: MapperConfig,
    pub scorer: ScorerConfig,
    pub tracker: TrackerConfig,
    pub detector: DetectorConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
}

/// Recorded session inputs for the `hazard-overlay` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// One frame descriptor per line
    pub frames_path: PathBuf,
    /// Recorded detections for replay detectors
    pub detections_path: Option<PathBuf>,
    /// FrameResult JSON lines; stdout when unset
    pub output_path: Option<PathBuf>,
    /// Sleep between frames to match recorded timestamps
    pub pace_to_timestamps: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            frames_path: PathBuf::from("session/frames.jsonl"),
            detections_path: Some(PathBuf::from("session/detections.jsonl")),
            output_path: None,
            pace_to_timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive; RUST_LOG wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "hazard_overlay=info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.analyzer().validate()?;
        self.detector.validate()?;

        let needs_recording = matches!(self.detector.realtime, DetectorSpec::Replay { .. })
            || matches!(self.detector.background, Some(DetectorSpec::Replay { .. }));
        if needs_recording && self.replay.detections_path.is_none() {
            return Err(PipelineError::invalid_config(
                "replay.detections_path",
                "required when a detector is of kind 'replay'",
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(PipelineError::invalid_config("logging.level", "must not be empty"));
        }
        Ok(())
    }

    /// The sections the frame analyzer owns.
    pub fn analyzer(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            scheduler: self.scheduler.clone(),
            mapper: self.mapper.clone(),
            scorer: self.scorer.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.scheduler.realtime_every_n_frames, 3);
        assert_eq!(config.tracker.min_detections_to_establish, 3);
        assert_eq!(config.logging.level, "hazard_overlay=info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let yaml = r#"
scheduler:
  realtime_every_n_frames: 2
tracker:
  association_distance_m: 1.5
mapper:
  reference_heights:
    forklift: 2.2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.realtime_every_n_frames, 2);
        assert_eq!(config.scheduler.background_every_m_frames, 15);
        assert_eq!(config.tracker.association_distance_m, 1.5);
        assert_eq!(config.mapper.reference_heights.get("forklift"), Some(&2.2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_weights_rejected() {
        let yaml = "scorer:\n  weights:\n    detection: 0.5\n    spatial: 0.5\n    temporal: 0.5\n    environmental: 0.5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_replay_detector_needs_recording() {
        let mut config = Config::default();
        config.replay.detections_path = None;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_load_reports_path_on_failure() {
        let path = std::env::temp_dir().join(format!("hazard-{}.yaml", uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&path).unwrap();
            writeln!(file, "tracker:\n  confidence_decay: 1.5").unwrap();
        }
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(&path.display().to_string()));
        fs::remove_file(&path).unwrap();

        assert!(Config::load("/nonexistent/hazard.yaml").is_err());
    }
}
