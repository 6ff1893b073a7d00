// src/error.rs
//
// Error taxonomy for the hazard pipeline.
//
// Only InvalidConfiguration is fatal, and only at construction time.
// Everything else has a degraded output and is counted per frame.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// A detector call did not complete inside its budget.
    #[error("{detector} detector timed out after {budget_ms:.0}ms")]
    Timeout { detector: String, budget_ms: f64 },

    /// Camera intrinsics absent or invalid; mapping falls back to screen space.
    #[error("missing geometry: {0}")]
    MissingGeometry(String),

    /// Detection rejected before mapping (confidence, bbox, or class).
    #[error("malformed detection ({class}): {reason}")]
    MalformedDetection { class: String, reason: String },

    /// Detector errored or could not be reached. Handled like a timeout.
    #[error("{detector} detector unavailable: {reason}")]
    DetectorUnavailable { detector: String, reason: String },

    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfiguration { field: String, reason: String },
}

impl PipelineError {
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedDetection {
            class: class.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(detector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DetectorUnavailable {
            detector: detector.into(),
            reason: reason.into(),
        }
    }

    /// Timeouts and unavailable detectors share the tracker-only fallback.
    pub fn is_detector_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::DetectorUnavailable { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_errors_are_fatal() {
        assert!(PipelineError::invalid_config("tracker.confidence_decay", "must be < 1").is_fatal());
        assert!(!PipelineError::MissingGeometry("no intrinsics".into()).is_fatal());
        assert!(!PipelineError::malformed("crane", "zero height").is_fatal());
    }

    #[test]
    fn test_timeout_and_unavailable_share_fallback() {
        let timeout = PipelineError::Timeout {
            detector: "realtime".into(),
            budget_ms: 150.0,
        };
        assert!(timeout.is_detector_failure());
        assert!(PipelineError::unavailable("remote", "connection refused").is_detector_failure());
        assert!(!PipelineError::MissingGeometry("fx=0".into()).is_detector_failure());
    }
}
