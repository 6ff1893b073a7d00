// src/analysis/spatial_mapper.rs
//
// 2D detection → 3D camera-frame position using the pinhole camera model.
//
//   depth = H_ref * fy / bbox_height_px
//   X     = (px - cx) * depth / fx
//   Y     = (py - cy) * depth / fy
//
// H_ref comes from the reference-dimension table. Positional uncertainty
// grows with depth and is reported, never folded silently into position.
//
// Without usable intrinsics the mapper degrades to screen space: normalized
// image coordinates, a MissingGeometry penalty, and no depth.

use super::reference_dimensions::ReferenceDimensions;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    CameraIntrinsics, ConfidencePenalty, Detection2D, Extent3, Position3, Positioning,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Same-class projections closer than this (meters) are one hazard
    pub dedup_distance_m: f64,
    /// Dedup gate for screen-space hazards (normalized image units)
    pub screen_dedup_distance: f64,
    /// Baseline depth error as a fraction of depth
    pub relative_depth_uncertainty: f64,
    /// Expected bbox height error in pixels (quantization + detector jitter)
    pub pixel_error_px: f64,
    /// Uncertainty multiplier when the class fell back to the default height
    pub unknown_class_uncertainty_multiplier: f64,
    /// Uncertainty multiplier when the bbox is cut by the image border
    pub truncation_uncertainty_multiplier: f64,
    /// Distance from the border (px) that counts as truncated
    pub edge_margin_px: f64,
    /// Height for classes missing from the table; None drops them as malformed
    pub default_reference_height_m: Option<f64>,
    /// Per-class height overrides (meters), merged over the built-in table
    pub reference_heights: HashMap<String, f64>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            dedup_distance_m: 2.0,
            screen_dedup_distance: 0.05,
            relative_depth_uncertainty: 0.05,
            pixel_error_px: 2.0,
            unknown_class_uncertainty_multiplier: 2.0,
            truncation_uncertainty_multiplier: 1.5,
            edge_margin_px: 2.0,
            default_reference_height_m: Some(super::reference_dimensions::DEFAULT_REFERENCE_HEIGHT_M),
            reference_heights: HashMap::new(),
        }
    }
}

impl MapperConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        positive("mapper.dedup_distance_m", self.dedup_distance_m)?;
        positive("mapper.screen_dedup_distance", self.screen_dedup_distance)?;
        positive("mapper.relative_depth_uncertainty", self.relative_depth_uncertainty)?;
        positive("mapper.pixel_error_px", self.pixel_error_px)?;
        at_least_one(
            "mapper.unknown_class_uncertainty_multiplier",
            self.unknown_class_uncertainty_multiplier,
        )?;
        at_least_one(
            "mapper.truncation_uncertainty_multiplier",
            self.truncation_uncertainty_multiplier,
        )?;
        if !self.edge_margin_px.is_finite() || self.edge_margin_px < 0.0 {
            return Err(PipelineError::invalid_config(
                "mapper.edge_margin_px",
                format!("must be finite and >= 0, got {}", self.edge_margin_px),
            ));
        }
        if let Some(h) = self.default_reference_height_m {
            positive("mapper.default_reference_height_m", h)?;
        }
        for (class, h) in &self.reference_heights {
            positive(&format!("mapper.reference_heights.{}", class), *h)?;
        }
        Ok(())
    }
}

fn positive(field: &str, value: f64) -> PipelineResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PipelineError::invalid_config(
            field,
            format!("must be positive and finite, got {}", value),
        ))
    }
}

fn at_least_one(field: &str, value: f64) -> PipelineResult<()> {
    if value.is_finite() && value >= 1.0 {
        Ok(())
    } else {
        Err(PipelineError::invalid_config(
            field,
            format!("must be finite and >= 1.0, got {}", value),
        ))
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SpatialEstimate {
    pub positioning: Positioning,
    pub position: Position3,
    pub extent: Extent3,
    /// 0.0 in screen space
    pub depth_m: f64,
    /// Positional standard deviation in meters (0.0 in screen space)
    pub uncertainty_m: f64,
    pub penalties: Vec<ConfidencePenalty>,
}

/// A validated, projected detection, possibly standing in for several raw
/// detections after dedup.
#[derive(Debug, Clone)]
pub struct MappedDetection {
    pub detection: Detection2D,
    pub estimate: SpatialEstimate,
    pub merged_detections: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MappedFrame {
    pub detections: Vec<MappedDetection>,
    /// Rejected detections, one error each
    pub dropped: Vec<PipelineError>,
    /// Raw detections folded into another by dedup
    pub merged: usize,
    /// Set when intrinsics were absent or invalid
    pub geometry_error: Option<PipelineError>,
}

// ============================================================================
// MAPPER
// ============================================================================

pub struct SpatialMapper {
    config: MapperConfig,
    references: ReferenceDimensions,
}

impl SpatialMapper {
    pub fn new(config: MapperConfig) -> Self {
        let references = ReferenceDimensions::with_overrides(
            &config.reference_heights,
            config.default_reference_height_m,
        );
        Self { config, references }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Pinhole projection of a single detection.
    pub fn project(
        &self,
        det: &Detection2D,
        intrinsics: &CameraIntrinsics,
    ) -> PipelineResult<SpatialEstimate> {
        det.check_well_formed()?;
        let reference = self.references.resolve(&det.class).ok_or_else(|| {
            PipelineError::malformed(
                det.class.as_str(),
                "no reference dimension and no default configured",
            )
        })?;

        let bbox = &det.bbox;
        let depth = reference.height_m * intrinsics.fy / bbox.height;
        let (px, py) = bbox.center();
        let x = (px - intrinsics.cx) * depth / intrinsics.fx;
        let y = (py - intrinsics.cy) * depth / intrinsics.fy;

        let width_m = reference.height_m * bbox.aspect_ratio();
        let extent = Extent3 {
            width: width_m,
            height: reference.height_m,
            depth: width_m,
        };

        let mut penalties = Vec::new();
        let mut uncertainty = depth
            * (self.config.relative_depth_uncertainty + self.config.pixel_error_px / bbox.height);
        if reference.is_fallback {
            uncertainty *= self.config.unknown_class_uncertainty_multiplier;
            penalties.push(ConfidencePenalty::UnknownClass);
        }
        if bbox.touches_edge(
            intrinsics.width as f64,
            intrinsics.height as f64,
            self.config.edge_margin_px,
        ) {
            uncertainty *= self.config.truncation_uncertainty_multiplier;
            penalties.push(ConfidencePenalty::TruncatedBox);
        }

        Ok(SpatialEstimate {
            positioning: Positioning::Spatial,
            position: Position3::new(x, y, depth),
            extent,
            depth_m: depth,
            uncertainty_m: uncertainty,
            penalties,
        })
    }

    /// Degraded 2D-only placement in normalized image coordinates.
    pub fn project_screen_space(
        &self,
        det: &Detection2D,
        frame_width: u32,
        frame_height: u32,
    ) -> PipelineResult<SpatialEstimate> {
        det.check_well_formed()?;
        let reference = self.references.resolve(&det.class).ok_or_else(|| {
            PipelineError::malformed(
                det.class.as_str(),
                "no reference dimension and no default configured",
            )
        })?;

        let w = frame_width.max(1) as f64;
        let h = frame_height.max(1) as f64;
        let (px, py) = det.bbox.center();

        let mut penalties = vec![ConfidencePenalty::MissingGeometry];
        if reference.is_fallback {
            penalties.push(ConfidencePenalty::UnknownClass);
        }

        Ok(SpatialEstimate {
            positioning: Positioning::ScreenSpace,
            position: Position3::new(px / w, py / h, 0.0),
            extent: Extent3 {
                width: det.bbox.width / w,
                height: det.bbox.height / h,
                depth: 0.0,
            },
            depth_m: 0.0,
            uncertainty_m: 0.0,
            penalties,
        })
    }

    /// Validate, project and dedup one frame's detections.
    pub fn map_frame(
        &self,
        detections: &[Detection2D],
        intrinsics: Option<&CameraIntrinsics>,
        frame_width: u32,
        frame_height: u32,
    ) -> MappedFrame {
        let geometry = match intrinsics {
            Some(intr) => intr.validate().map(|_| intr),
            None => Err(PipelineError::MissingGeometry(
                "no camera intrinsics for frame".to_string(),
            )),
        };

        let mut frame = MappedFrame::default();
        let mut mapped = Vec::with_capacity(detections.len());

        for det in detections {
            let estimate = match &geometry {
                Ok(intr) => self.project(det, intr),
                Err(_) => self.project_screen_space(det, frame_width, frame_height),
            };
            match estimate {
                Ok(estimate) => mapped.push(MappedDetection {
                    detection: det.clone(),
                    estimate,
                    merged_detections: 1,
                }),
                Err(e) => {
                    debug!("Dropping detection: {}", e);
                    frame.dropped.push(e);
                }
            }
        }

        let (deduped, merged) = self.deduplicate(mapped);
        frame.detections = deduped;
        frame.merged = merged;
        frame.geometry_error = geometry.err();
        frame
    }

    /// Merge same-class projections inside the dedup gate.
    ///
    /// Greedy in descending detector confidence: the strongest detection of a
    /// cluster keeps its class, bbox and extent; the cluster position is the
    /// confidence-weighted mean of its members.
    pub fn deduplicate(&self, mut mapped: Vec<MappedDetection>) -> (Vec<MappedDetection>, usize) {
        mapped.sort_by(|a, b| {
            b.detection
                .confidence
                .partial_cmp(&a.detection.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        struct Cluster {
            keeper: MappedDetection,
            weighted_sum: Position3,
            weight_total: f64,
        }

        impl Cluster {
            fn mean(&self) -> Position3 {
                self.weighted_sum / self.weight_total
            }
        }

        let mut clusters: Vec<Cluster> = Vec::with_capacity(mapped.len());
        let mut merged = 0;

        for m in mapped {
            let gate = match m.estimate.positioning {
                Positioning::Spatial => self.config.dedup_distance_m,
                Positioning::ScreenSpace => self.config.screen_dedup_distance,
            };
            // Zero-confidence detections still count, just barely.
            let weight = (m.detection.confidence as f64).max(1e-6);

            let nearest = clusters
                .iter_mut()
                .filter(|c| {
                    c.keeper.detection.class == m.detection.class
                        && c.keeper.estimate.positioning == m.estimate.positioning
                })
                .map(|c| {
                    let dist = (c.mean() - m.estimate.position).norm();
                    (c, dist)
                })
                .filter(|(_, dist)| *dist <= gate)
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            match nearest {
                Some((cluster, dist)) => {
                    debug!(
                        "Dedup: {} merged into cluster (dist={:.2}, conf={:.2})",
                        m.detection.class, dist, m.detection.confidence
                    );
                    cluster.weighted_sum += m.estimate.position * weight;
                    cluster.weight_total += weight;
                    cluster.keeper.merged_detections += m.merged_detections;
                    merged += 1;
                }
                None => clusters.push(Cluster {
                    weighted_sum: m.estimate.position * weight,
                    weight_total: weight,
                    keeper: m,
                }),
            }
        }

        let deduped = clusters
            .into_iter()
            .map(|c| {
                let mean = c.mean();
                let mut keeper = c.keeper;
                keeper.estimate.position = mean;
                if keeper.estimate.positioning == Positioning::Spatial {
                    keeper.estimate.depth_m = mean.z;
                }
                keeper
            })
            .collect();

        (deduped, merged)
    }
}

// ============================================================================
// TESTS
// ============================================================================
