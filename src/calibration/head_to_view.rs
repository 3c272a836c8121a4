//! Head-to-view calibration: where the rendering viewpoint sits relative to
//! the tracked head anchor.
//!
//! The view frame is attached to the head by `offset` (expressed in the head
//! frame) and `rotation`. The two eyes are displaced from the view centre by
//! half the interpupillary distance along the view frame's `x` axis; the left
//! eye sits on `-x`.

use crate::calibration::{CalibrationError, UNCALIBRATED_ERROR};
use crate::geometry::Pose;
use log::info;
use nalgebra::{Point3, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Which viewpoint a tracked sample or a rendered view belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left,
    Right,
    /// A generic tracked object anchor with no lateral eye offset.
    Object,
}

impl Eye {
    /// `-1` for the left eye, `+1` for the right eye, `0` for an object anchor.
    pub fn lateral_sign(&self) -> f64 {
        match self {
            Eye::Left => -1.0,
            Eye::Right => 1.0,
            Eye::Object => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Eye::Left => "left",
            Eye::Right => "right",
            Eye::Object => "object",
        }
    }
}

impl fmt::Display for Eye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Eye {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Eye::Left),
            "right" => Ok(Eye::Right),
            "object" => Ok(Eye::Object),
            other => Err(CalibrationError::InvalidParams(format!(
                "unknown anchor '{other}', expected left, right or object"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeadToViewFile {
    offset: [f64; 3],
    /// Quaternion as `[x, y, z, w]`.
    rotation: [f64; 4],
    error: f64,
}

/// Translation and rotation from the tracked head anchor to the view frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadToViewCalibration {
    offset: Vector3<f64>,
    rotation: UnitQuaternion<f64>,
    error: f64,
}

impl HeadToViewCalibration {
    pub fn new(offset: Vector3<f64>, rotation: UnitQuaternion<f64>, error: f64) -> Self {
        Self {
            offset,
            rotation,
            error,
        }
    }

    /// Zero offset, identity rotation, error set to [`UNCALIBRATED_ERROR`].
    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity(), UNCALIBRATED_ERROR)
    }

    pub fn offset(&self) -> &Vector3<f64> {
        &self.offset
    }

    pub fn rotation(&self) -> &UnitQuaternion<f64> {
        &self.rotation
    }

    pub fn error(&self) -> f64 {
        self.error
    }

    pub fn is_calibrated(&self) -> bool {
        self.error < UNCALIBRATED_ERROR
    }

    /// Offset of `eye` from the head anchor, in the head frame.
    pub fn eye_offset(&self, eye: Eye, interpupillary_distance: f64) -> Vector3<f64> {
        let lateral = Vector3::new(eye.lateral_sign() * 0.5 * interpupillary_distance, 0.0, 0.0);
        self.offset + self.rotation * lateral
    }

    /// Pose of the `eye` viewpoint given the head pose in the same space.
    pub fn view_pose(&self, head: &Pose, eye: Eye, interpupillary_distance: f64) -> Pose {
        let offset = self.eye_offset(eye, interpupillary_distance);
        Pose::new(
            head.transform_point(&Point3::from(offset)),
            head.rotation * self.rotation,
        )
    }

    /// Head pose that puts the `eye` viewpoint at `view`. Inverse of
    /// [`HeadToViewCalibration::view_pose`].
    pub fn head_pose(&self, view: &Pose, eye: Eye, interpupillary_distance: f64) -> Pose {
        let rotation = view.rotation * self.rotation.inverse();
        let offset = self.eye_offset(eye, interpupillary_distance);
        Pose::new(view.position - rotation * offset, rotation)
    }

    pub fn to_json_string(&self) -> Result<String, CalibrationError> {
        let q = self.rotation.quaternion();
        let file = HeadToViewFile {
            offset: [self.offset.x, self.offset.y, self.offset.z],
            rotation: [q.i, q.j, q.k, q.w],
            error: self.error,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, CalibrationError> {
        let file: HeadToViewFile = serde_json::from_str(contents)?;
        let [x, y, z, w] = file.rotation;
        let quaternion = Quaternion::new(w, x, y, z);
        let norm = quaternion.norm();
        if !norm.is_finite() || norm < 1e-6 || file.offset.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidCalibrationFile(
                "head-to-view offset and rotation must be finite and the rotation non-zero"
                    .to_string(),
            ));
        }
        if file.error.is_nan() || file.error < 0.0 {
            return Err(CalibrationError::InvalidCalibrationFile(format!(
                "error must be a non-negative number, found {}",
                file.error
            )));
        }
        Ok(Self::new(
            Vector3::from(file.offset),
            UnitQuaternion::from_quaternion(quaternion),
            file.error,
        ))
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?)?;
        info!("Saved head-to-view calibration to {}", path.display());
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }
}

impl Default for HeadToViewCalibration {
    fn default() -> Self {
        Self::identity()
    }
}
