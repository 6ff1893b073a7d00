// src/analysis/confidence_scorer.rs
//
// Multi-factor hazard confidence.
//
// A single detector score says nothing about whether the hazard is where we
// think it is or whether it has been seen before. The scorer blends four
// factors, each in [0, 1]:
//
//   detection      detector confidence, passed through
//   spatial        falls off with positional uncertainty, never below a floor
//   temporal       recency-weighted track history, plus a stability boost
//   environmental  frame quality from the capture layer
//
// overall = clamp(Σ wᵢ·fᵢ, 0, 1). The breakdown always travels with the
// scalar so degraded inputs stay visible downstream.

use crate::analysis::hazard_tracker::{TemporalEvidence, TrackState};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{ConfidencePenalty, FactorBreakdown, Positioning};
use serde::{Deserialize, Serialize};

const WEIGHT_SUM_TOLERANCE: f32 = 1e-3;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub detection: f32,
    pub spatial: f32,
    pub temporal: f32,
    pub environmental: f32,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            detection: 0.40,
            spatial: 0.25,
            temporal: 0.20,
            environmental: 0.15,
        }
    }
}

impl FactorWeights {
    pub fn sum(&self) -> f32 {
        self.detection + self.spatial + self.temporal + self.environmental
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let named = [
            ("scorer.weights.detection", self.detection),
            ("scorer.weights.spatial", self.spatial),
            ("scorer.weights.temporal", self.temporal),
            ("scorer.weights.environmental", self.environmental),
        ];
        for (field, w) in named {
            if !w.is_finite() || w <= 0.0 {
                return Err(PipelineError::invalid_config(
                    field,
                    format!("weight must be positive and finite, got {}", w),
                ));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(PipelineError::invalid_config(
                "scorer.weights",
                format!("weights must sum to 1.0, got {:.4}", sum),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub weights: FactorWeights,
    /// Spatial factor never drops below this
    pub spatial_floor: f32,
    /// Uncertainty (m) at which the spatial factor has fallen by 1/e
    pub spatial_scale_m: f64,
    /// Fixed spatial factor for screen-space hazards
    pub degraded_spatial_factor: f32,
    /// Environmental factor when no quality signal is supplied
    pub neutral_environmental: f32,
    /// Share of the temporal factor earned by accumulated evidence
    pub temporal_evidence_share: f32,
    /// Added once the matched track is ESTABLISHED
    pub stability_boost: f32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            spatial_floor: 0.1,
            spatial_scale_m: 2.0,
            degraded_spatial_factor: 0.2,
            neutral_environmental: 0.5,
            temporal_evidence_share: 0.8,
            stability_boost: 0.2,
        }
    }
}

impl ScorerConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        self.weights.validate()?;

        let unit = [
            ("scorer.spatial_floor", self.spatial_floor),
            ("scorer.degraded_spatial_factor", self.degraded_spatial_factor),
            ("scorer.neutral_environmental", self.neutral_environmental),
            ("scorer.temporal_evidence_share", self.temporal_evidence_share),
            ("scorer.stability_boost", self.stability_boost),
        ];
        for (field, v) in unit {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::invalid_config(
                    field,
                    format!("must be within [0, 1], got {}", v),
                ));
            }
        }
        if self.spatial_floor >= 1.0 {
            return Err(PipelineError::invalid_config(
                "scorer.spatial_floor",
                "must be below 1.0",
            ));
        }
        if !self.spatial_scale_m.is_finite() || self.spatial_scale_m <= 0.0 {
            return Err(PipelineError::invalid_config(
                "scorer.spatial_scale_m",
                format!("must be positive and finite, got {}", self.spatial_scale_m),
            ));
        }
        Ok(())
    }
}

/// Temporal parameters shared with the tracker, so both agree on what
/// "recent" and "established" mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalWindow {
    pub window_ms: f64,
    pub min_detections: u32,
}

// ============================================================================
// TYPES
// ============================================================================

/// Everything the scorer looks at for one mapped detection.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub detection_confidence: f32,
    pub uncertainty_m: f64,
    pub positioning: Positioning,
    /// Penalties already raised by the mapper
    pub penalties: &'a [ConfidencePenalty],
    /// History of the track this detection is likely to join, if any
    pub evidence: Option<&'a TemporalEvidence>,
    pub quality: Option<f32>,
    pub at_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredConfidence {
    pub overall: f32,
    pub factors: FactorBreakdown,
}

// ============================================================================
// SCORER
// ============================================================================

pub struct ConfidenceScorer {
    config: ScorerConfig,
    window: TemporalWindow,
}

impl ConfidenceScorer {
    pub fn new(config: ScorerConfig, window: TemporalWindow) -> Self {
        Self { config, window }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn score(&self, input: &ScoringInput<'_>) -> ScoredConfidence {
        let mut penalties = input.penalties.to_vec();

        let detection = clamp_unit(input.detection_confidence);

        let spatial = match input.positioning {
            Positioning::Spatial => self.spatial_factor(input.uncertainty_m),
            Positioning::ScreenSpace => {
                if !penalties.contains(&ConfidencePenalty::MissingGeometry) {
                    penalties.push(ConfidencePenalty::MissingGeometry);
                }
                self.config.degraded_spatial_factor
            }
        };

        let temporal = input
            .evidence
            .map(|e| self.temporal_factor(e, input.at_ms))
            .unwrap_or(0.0);

        let environmental = input
            .quality
            .filter(|q| q.is_finite())
            .map(clamp_unit)
            .unwrap_or(self.config.neutral_environmental);

        let factors = FactorBreakdown {
            detection,
            spatial,
            temporal,
            environmental,
            decay: 1.0,
            penalties,
        };
        ScoredConfidence {
            overall: self.combine(&factors),
            factors,
        }
    }

    /// Weighted sum of the breakdown, clamped, times its decay multiplier.
    pub fn combine(&self, factors: &FactorBreakdown) -> f32 {
        let w = &self.config.weights;
        let sum = w.detection * factors.detection
            + w.spatial * factors.spatial
            + w.temporal * factors.temporal
            + w.environmental * factors.environmental;
        clamp_unit(sum) * factors.decay
    }

    /// `floor + (1 - floor) * exp(-σ / scale)`: 1.0 at zero uncertainty.
    pub fn spatial_factor(&self, uncertainty_m: f64) -> f32 {
        let floor = self.config.spatial_floor;
        if !uncertainty_m.is_finite() {
            return floor;
        }
        let falloff = (-uncertainty_m.max(0.0) / self.config.spatial_scale_m).exp() as f32;
        floor + (1.0 - floor) * falloff
    }

    pub fn temporal_factor(&self, evidence: &TemporalEvidence, at_ms: f64) -> f32 {
        let window = self.window.window_ms;
        let weighted: f64 = evidence
            .sample_times_ms
            .iter()
            .filter_map(|t| {
                // Late samples can be stamped after `at_ms`; treat them as fresh.
                let age = (at_ms - t).max(0.0);
                (age <= window).then(|| (-age / window).exp())
            })
            .sum();

        let needed = self.window.min_detections.max(1) as f64;
        let mut temporal =
            self.config.temporal_evidence_share * (weighted / needed).min(1.0) as f32;
        if evidence.state == TrackState::Established {
            temporal += self.config.stability_boost;
        }
        clamp_unit(temporal)
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
