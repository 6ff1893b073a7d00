// src/analysis/ego_motion.rs
//
// Camera ego-motion between consecutive frames.
//
// The capture layer reports how the camera moved since the previous frame
// (translation in meters, roll/pitch/yaw in radians). Static hazards appear
// to move by the inverse of that motion, so tracked positions are mapped
// through the inverse delta before association. Without this, a walking
// user would smear every track across the association gate.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Pose of the current camera expressed in the previous camera's frame.
/// Angles rotate about the camera x (roll), y (pitch) and z (yaw) axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EgoMotionDelta {
    pub translation: Vector3<f64>,
    #[serde(default)]
    pub roll: f64,
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
}

impl EgoMotionDelta {
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        }
    }

    pub fn translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            translation: Vector3::new(x, y, z),
            ..Self::identity()
        }
    }

    pub fn with_rotation(mut self, roll: f64, pitch: f64, yaw: f64) -> Self {
        self.roll = roll;
        self.pitch = pitch;
        self.yaw = yaw;
        self
    }

    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.roll.is_finite()
            && self.pitch.is_finite()
            && self.yaw.is_finite()
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw),
        )
    }

    /// Map a point from the previous camera frame into the current one.
    pub fn compensate(&self, position: &Vector3<f64>) -> Vector3<f64> {
        compensate_with(&self.isometry(), position)
    }
}

/// Apply the inverse of an accumulated camera motion to a point.
pub fn compensate_with(motion: &Isometry3<f64>, position: &Vector3<f64>) -> Vector3<f64> {
    motion
        .inverse_transform_point(&Point3::from(*position))
        .coords
}
