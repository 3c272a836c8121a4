//! Packing of the calibration unknowns into the solver's parameter vector.
//!
//! The vector is laid out as
//! `[r_display(3), t_display(3), s_display(3)?, h_offset(3)?, r_view(3)?]`
//! where rotations are absolute rotation vectors (axis times angle, radians).
//! The optional blocks are present only when [`ParameterLayout`] asks for them;
//! otherwise their values stay fixed at what the caller supplied.

use crate::calibration::{HeadToViewCalibration, RigidTransform};
use crate::geometry::{quaternion_to_rotation_vector, rotation_vector_to_quaternion};
use nalgebra::{DVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Which optional blocks the solver estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterLayout {
    pub estimate_scale: bool,
    pub estimate_head_to_view: bool,
}

impl Default for ParameterLayout {
    fn default() -> Self {
        Self {
            estimate_scale: false,
            estimate_head_to_view: true,
        }
    }
}

/// Index ranges of each block inside the parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOffsets {
    pub rotation: usize,
    pub translation: usize,
    pub scale: Option<usize>,
    pub head_offset: Option<usize>,
    pub view_rotation: Option<usize>,
}

impl ParameterLayout {
    pub fn new(estimate_scale: bool, estimate_head_to_view: bool) -> Self {
        Self {
            estimate_scale,
            estimate_head_to_view,
        }
    }

    /// Length of the parameter vector.
    pub fn len(&self) -> usize {
        let mut len = 6;
        if self.estimate_scale {
            len += 3;
        }
        if self.estimate_head_to_view {
            len += 6;
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn offsets(&self) -> BlockOffsets {
        let scale = self.estimate_scale.then_some(6);
        let after_scale = if self.estimate_scale { 9 } else { 6 };
        BlockOffsets {
            rotation: 0,
            translation: 3,
            scale,
            head_offset: self.estimate_head_to_view.then_some(after_scale),
            view_rotation: self.estimate_head_to_view.then_some(after_scale + 3),
        }
    }

    /// Packs the estimated blocks of `estimate` into a parameter vector.
    pub fn encode(&self, estimate: &CalibrationEstimate) -> DVector<f64> {
        let mut x = DVector::zeros(self.len());
        let offsets = self.offsets();
        x.fixed_rows_mut::<3>(offsets.rotation)
            .copy_from(&estimate.rotation);
        x.fixed_rows_mut::<3>(offsets.translation)
            .copy_from(&estimate.translation);
        if let Some(i) = offsets.scale {
            x.fixed_rows_mut::<3>(i).copy_from(&estimate.scale);
        }
        if let Some(i) = offsets.head_offset {
            x.fixed_rows_mut::<3>(i).copy_from(&estimate.head_offset);
        }
        if let Some(i) = offsets.view_rotation {
            x.fixed_rows_mut::<3>(i).copy_from(&estimate.view_rotation);
        }
        x
    }

    /// Unpacks `x`, taking the blocks that are not estimated from `fixed`.
    pub fn decode(&self, x: &DVector<f64>, fixed: &CalibrationEstimate) -> CalibrationEstimate {
        let offsets = self.offsets();
        let block = |i: usize| -> Vector3<f64> { x.fixed_rows::<3>(i).into_owned() };
        CalibrationEstimate {
            rotation: block(offsets.rotation),
            translation: block(offsets.translation),
            scale: offsets.scale.map_or(fixed.scale, block),
            head_offset: offsets.head_offset.map_or(fixed.head_offset, block),
            view_rotation: offsets.view_rotation.map_or(fixed.view_rotation, block),
        }
    }

    /// Per-entry bound half-widths: `rotation` radians for rotation blocks,
    /// `translation` metres for translation and offset blocks, `scale` for
    /// the scale block.
    pub fn half_widths(&self, rotation: f64, translation: f64, scale: f64) -> DVector<f64> {
        let mut widths = DVector::zeros(self.len());
        let offsets = self.offsets();
        widths.fixed_rows_mut::<3>(offsets.rotation).fill(rotation);
        widths.fixed_rows_mut::<3>(offsets.translation).fill(translation);
        if let Some(i) = offsets.scale {
            widths.fixed_rows_mut::<3>(i).fill(scale);
        }
        if let Some(i) = offsets.head_offset {
            widths.fixed_rows_mut::<3>(i).fill(translation);
        }
        if let Some(i) = offsets.view_rotation {
            widths.fixed_rows_mut::<3>(i).fill(rotation);
        }
        widths
    }
}

/// Calibration unknowns in solver form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEstimate {
    /// Display rotation as a rotation vector.
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
    pub scale: Vector3<f64>,
    /// Head-to-view offset, head frame.
    pub head_offset: Vector3<f64>,
    /// Head-to-view rotation as a rotation vector.
    pub view_rotation: Vector3<f64>,
}

impl CalibrationEstimate {
    /// Identity transform, unit scale, zero head-to-view offset.
    pub fn identity() -> Self {
        Self {
            rotation: Vector3::zeros(),
            translation: Vector3::zeros(),
            scale: Vector3::new(1.0, 1.0, 1.0),
            head_offset: Vector3::zeros(),
            view_rotation: Vector3::zeros(),
        }
    }

    pub fn from_calibrations(display: &RigidTransform, head_to_view: &HeadToViewCalibration) -> Self {
        Self {
            rotation: quaternion_to_rotation_vector(&display.rotation()),
            translation: display.translation(),
            scale: display.scale(),
            head_offset: *head_to_view.offset(),
            view_rotation: quaternion_to_rotation_vector(head_to_view.rotation()),
        }
    }

    pub fn display_rotation(&self) -> UnitQuaternion<f64> {
        rotation_vector_to_quaternion(&self.rotation)
    }

    pub fn view_rotation_quaternion(&self) -> UnitQuaternion<f64> {
        rotation_vector_to_quaternion(&self.view_rotation)
    }

    /// Returns a copy with the display rotation pre-multiplied by `delta`.
    pub fn rotated(&self, delta: &UnitQuaternion<f64>) -> Self {
        Self {
            rotation: quaternion_to_rotation_vector(&(delta * self.display_rotation())),
            ..*self
        }
    }

    pub fn to_display_transform(&self, error: f64) -> RigidTransform {
        RigidTransform::from_parts(&self.translation, &self.display_rotation(), &self.scale, error)
    }

    pub fn to_head_to_view(&self, error: f64) -> HeadToViewCalibration {
        HeadToViewCalibration::new(self.head_offset, self.view_rotation_quaternion(), error)
    }

    pub fn is_finite(&self) -> bool {
        [
            self.rotation,
            self.translation,
            self.scale,
            self.head_offset,
            self.view_rotation,
        ]
        .iter()
        .all(|v| v.iter().all(|c| c.is_finite()))
    }
}

impl Default for CalibrationEstimate {
    fn default() -> Self {
        Self::identity()
    }
}
