//! Pose and frame value types plus the rotation metric.
//!
//! All coordinates are right-handed and expressed in metres. Views look along
//! their local `+Z` axis.

use nalgebra::{Point3, UnitQuaternion, Vector3};

pub mod rotation;

pub use rotation::{
    geodesic_distance, geodesic_distance_acos, geodesic_distance_deg,
    quaternion_to_rotation_vector, rotation_vector_to_quaternion,
};

/// A tracked anchor: a position and an orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Point3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(position: Point3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Point3::origin(),
            rotation: UnitQuaternion::identity(),
        }
    }

    /// Returns `true` when every position and quaternion component is finite.
    pub fn is_finite(&self) -> bool {
        self.position.coords.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
    }

    /// Maps a point expressed in this pose's local frame into the parent frame.
    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * local.coords
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// A coordinate frame with anisotropic scale.
///
/// Points map from the local frame into the parent frame as
/// `p_parent = position + rotation · (scale ⊙ p_local)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub position: Point3<f64>,
    pub rotation: UnitQuaternion<f64>,
    pub scale: Vector3<f64>,
}

impl Frame {
    pub fn new(position: Point3<f64>, rotation: UnitQuaternion<f64>, scale: Vector3<f64>) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// A frame with unit scale located at `pose`.
    pub fn from_pose(pose: &Pose) -> Self {
        Self::new(pose.position, pose.rotation, Vector3::repeat(1.0))
    }

    pub fn transform_point(&self, local: &Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * local.coords.component_mul(&self.scale)
    }

    pub fn inverse_transform_point(&self, parent: &Point3<f64>) -> Point3<f64> {
        let unrotated = self.rotation.inverse() * (parent - self.position);
        Point3::from(unrotated.component_div(&self.scale))
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::from_pose(&Pose::identity())
    }
}
